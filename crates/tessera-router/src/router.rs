// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fork router: dispatches inbound messages through isolated processing,
//! outgoing and recovery forks.
//!
//! Each fork is a pure `handle(input) -> Result<output, ForkFailure>`. The
//! router runs every fork behind `catch_unwind`, so a panicking or failing
//! fork is reported and never takes down the pass or other forks.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};

use chrono::{DateTime, Duration, Utc};
use tessera_config::model::RouterConfig;
use tessera_core::types::SessionId;
use tessera_core::{ErrorKind, TesseraError};
use tracing::{debug, warn};

use crate::compression;
use crate::message::{
    BackupPayload, BackupRecord, ContentMessage, ContextDelivery, Envelope, Inbound, MessageId,
    Outbound, Processed, ProcessedContent, RecoveryAction, SearchRequest, SessionNotice,
    StorageNotice,
};
use crate::priority::PriorityScorer;
use crate::profiles::{ProviderProfile, ProviderProfiles};
use crate::recovery;

/// Longest preview carried by a session broadcast.
const PREVIEW_CHARS: usize = 120;

/// A failure signal raised by a fork.
#[derive(Debug, Clone, PartialEq)]
pub struct ForkFailure {
    pub fork: &'static str,
    pub kind: ErrorKind,
    pub message: String,
    pub panicked: bool,
}

impl ForkFailure {
    pub fn new(fork: &'static str, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            fork,
            kind,
            message: message.into(),
            panicked: false,
        }
    }
}

impl From<ForkFailure> for TesseraError {
    fn from(failure: ForkFailure) -> Self {
        TesseraError::RoutingFailure {
            fork: failure.fork.to_string(),
            message: failure.message,
        }
    }
}

/// One routing stage.
pub trait Fork {
    type Input;
    type Output;

    fn name(&self) -> &'static str;

    fn handle(&self, input: Self::Input) -> Result<Self::Output, ForkFailure>;
}

/// Run a fork, converting a panic into a failure signal.
fn run<F: Fork>(fork: &F, input: F::Input) -> Result<F::Output, ForkFailure> {
    match catch_unwind(AssertUnwindSafe(|| fork.handle(input))) {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "fork panicked".to_string());
            Err(ForkFailure {
                fork: fork.name(),
                kind: ErrorKind::RoutingFailure,
                message,
                panicked: true,
            })
        }
    }
}

fn truncate_bytes(text: &str, max_bytes: usize) -> (&str, bool) {
    if text.len() <= max_bytes {
        return (text, false);
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    (&text[..end], true)
}

/// Normalizes content to the provider's profile.
pub struct Normalizer<'a> {
    profiles: &'a ProviderProfiles,
}

impl Fork for Normalizer<'_> {
    type Input = ContentMessage;
    type Output = (ContentMessage, ProviderProfile, bool);

    fn name(&self) -> &'static str {
        "normalize"
    }

    fn handle(&self, mut message: ContentMessage) -> Result<Self::Output, ForkFailure> {
        if message.provider_tag.trim().is_empty() {
            return Err(ForkFailure::new(
                self.name(),
                ErrorKind::CaptureRejected,
                "content has no provider tag",
            ));
        }
        let profile = self.profiles.resolve(&message.provider_tag);
        message.provider_tag = profile.name.clone();
        let (text, truncated) = truncate_bytes(message.text.trim(), profile.max_size_bytes);
        message.text = text.to_string();
        Ok((message, profile, truncated))
    }
}

/// Assigns a priority level.
pub struct Prioritizer<'a> {
    scorer: &'a PriorityScorer,
}

impl Fork for Prioritizer<'_> {
    type Input = (ContentMessage, ProviderProfile, bool);
    type Output = ProcessedContent;

    fn name(&self) -> &'static str {
        "priority"
    }

    fn handle(&self, (message, profile, truncated): Self::Input) -> Result<Self::Output, ForkFailure> {
        let priority =
            self.scorer
                .assess(&message.text, message.summary.is_some(), profile.priority_bias);
        Ok(ProcessedContent {
            message,
            profile,
            truncated,
            priority,
            payload: None,
        })
    }
}

/// Builds the backup payload, compressing when allowed.
pub struct Compressor;

impl Fork for Compressor {
    type Input = ProcessedContent;
    type Output = ProcessedContent;

    fn name(&self) -> &'static str {
        "compress"
    }

    fn handle(&self, mut content: ProcessedContent) -> Result<Self::Output, ForkFailure> {
        let raw = &content.message.block;
        let level =
            compression::choose_level(content.priority.level, raw.len(), content.profile.compress);
        let payload = match level {
            Some(level) => {
                let packed = compression::compress(raw, level).map_err(|e| {
                    ForkFailure::new(self.name(), ErrorKind::Internal, e.to_string())
                })?;
                if packed.len() < raw.len() {
                    BackupPayload {
                        compressed: true,
                        level: Some(level),
                        bytes: packed,
                    }
                } else {
                    BackupPayload {
                        compressed: false,
                        level: None,
                        bytes: raw.clone(),
                    }
                }
            }
            None => BackupPayload {
                compressed: false,
                level: None,
                bytes: raw.clone(),
            },
        };
        content.payload = Some(payload);
        Ok(content)
    }
}

/// Emits a backup record for content that requires one.
pub struct BackupFork {
    enabled: bool,
}

impl Fork for BackupFork {
    type Input = ProcessedContent;
    type Output = Option<BackupRecord>;

    fn name(&self) -> &'static str {
        "backup"
    }

    fn handle(&self, content: ProcessedContent) -> Result<Self::Output, ForkFailure> {
        if !self.enabled || !content.priority.backup_required() {
            return Ok(None);
        }
        let payload = content.payload.ok_or_else(|| {
            ForkFailure::new(self.name(), ErrorKind::Internal, "no backup payload")
        })?;
        Ok(Some(BackupRecord {
            fragment_id: content.message.fragment_id,
            address: content.message.address,
            priority: content.priority.level,
            compressed: payload.compressed,
            payload: payload.bytes,
        }))
    }
}

/// Fans a notice out to other active sessions.
pub struct Broadcaster;

impl Fork for Broadcaster {
    type Input = (ProcessedContent, Vec<SessionId>);
    type Output = Option<SessionNotice>;

    fn name(&self) -> &'static str {
        "session_broadcast"
    }

    fn handle(&self, (content, active): Self::Input) -> Result<Self::Output, ForkFailure> {
        let origin = content.message.session_id.clone();
        let recipients: Vec<SessionId> = active.into_iter().filter(|s| *s != origin).collect();
        if recipients.is_empty() {
            return Ok(None);
        }
        let source = content
            .message
            .summary
            .as_deref()
            .unwrap_or(&content.message.text);
        let preview: String = source.chars().take(PREVIEW_CHARS).collect();
        Ok(Some(SessionNotice {
            origin,
            recipients,
            fragment_id: content.message.fragment_id,
            address: content.message.address,
            priority: content.priority.level,
            preview,
        }))
    }
}

/// Assembles a bounded text block from search results.
pub struct ContextAssembler {
    max_chars: usize,
}

impl Fork for ContextAssembler {
    type Input = SearchRequest;
    type Output = ContextDelivery;

    fn name(&self) -> &'static str {
        "context_delivery"
    }

    fn handle(&self, request: SearchRequest) -> Result<Self::Output, ForkFailure> {
        let mut text = String::new();
        let mut addresses = Vec::new();
        let mut truncated = false;
        for hit in &request.hits {
            let line = if hit.tag.keywords.is_empty() {
                format!("[{}] {}\n", hit.tag.address, hit.tag.summary)
            } else {
                format!(
                    "[{}] {} ({})\n",
                    hit.tag.address,
                    hit.tag.summary,
                    hit.tag.keywords.join(", ")
                )
            };
            if text.chars().count() + line.chars().count() > self.max_chars {
                truncated = true;
                break;
            }
            text.push_str(&line);
            addresses.push(hit.tag.address);
        }
        Ok(ContextDelivery {
            session_id: request.session_id,
            query: request.query,
            text,
            addresses,
            truncated,
        })
    }
}

/// Maps a storage failure to a recovery strategy.
pub struct RecoveryFork<'a> {
    config: &'a RouterConfig,
}

impl Fork for RecoveryFork<'_> {
    type Input = StorageNotice;
    type Output = RecoveryAction;

    fn name(&self) -> &'static str {
        "recovery"
    }

    fn handle(&self, notice: StorageNotice) -> Result<Self::Output, ForkFailure> {
        let strategy = recovery::select_strategy(notice.kind, notice.operation, self.config)
            .ok_or_else(|| {
                ForkFailure::new(
                    self.name(),
                    notice.kind,
                    format!("no recovery path: {}", notice.message),
                )
            })?;
        Ok(RecoveryAction {
            operation: notice.operation,
            fragment_id: notice.fragment_id,
            address: notice.address,
            kind: notice.kind,
            strategy,
        })
    }
}

/// Everything one routing pass produced.
#[derive(Debug, Default)]
pub struct RoutingReport {
    pub outputs: Vec<Outbound>,
    pub failures: Vec<ForkFailure>,
    /// Envelopes skipped because their id was already routed in this pass.
    pub duplicates: Vec<MessageId>,
}

impl RoutingReport {
    pub fn backups(&self) -> impl Iterator<Item = &BackupRecord> {
        self.outputs.iter().filter_map(|o| match o {
            Outbound::Backup(record) => Some(record),
            _ => None,
        })
    }

    pub fn recoveries(&self) -> impl Iterator<Item = &RecoveryAction> {
        self.outputs.iter().filter_map(|o| match o {
            Outbound::Recovery(action) => Some(action),
            _ => None,
        })
    }
}

/// Routes typed messages through the fork graph.
pub struct ForkRouter {
    config: RouterConfig,
    profiles: ProviderProfiles,
    scorer: PriorityScorer,
    sessions: HashMap<SessionId, DateTime<Utc>>,
}

impl ForkRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            profiles: ProviderProfiles::from_config(&config),
            scorer: PriorityScorer::new(),
            sessions: HashMap::new(),
            config,
        }
    }

    /// Record activity for a session so it receives broadcasts.
    pub fn touch_session(&mut self, session: &SessionId, now: DateTime<Utc>) {
        self.sessions.insert(session.clone(), now);
    }

    /// Sessions seen within the idle window, sorted by id. Idle sessions are dropped.
    pub fn active_sessions(&mut self, now: DateTime<Utc>) -> Vec<SessionId> {
        let idle = Duration::try_seconds(i64::try_from(self.config.session_idle_secs).unwrap_or(i64::MAX))
            .unwrap_or(Duration::MAX);
        self.sessions.retain(|_, seen| now - *seen <= idle);
        let mut active: Vec<SessionId> = self.sessions.keys().cloned().collect();
        active.sort();
        active
    }

    /// Route a single envelope.
    pub fn route(&mut self, envelope: Envelope, now: DateTime<Utc>) -> RoutingReport {
        self.route_pass(vec![envelope], now)
    }

    /// Route a batch. Each message id is delivered at most once per pass.
    pub fn route_pass(&mut self, envelopes: Vec<Envelope>, now: DateTime<Utc>) -> RoutingReport {
        let active = self.active_sessions(now);
        let mut report = RoutingReport::default();
        let mut seen: HashSet<MessageId> = HashSet::new();

        for envelope in envelopes {
            if !seen.insert(envelope.id.clone()) {
                debug!(message_id = %envelope.id, "duplicate message id in pass, skipped");
                report.duplicates.push(envelope.id);
                continue;
            }
            let processed = match self.process(envelope.message) {
                Ok(processed) => processed,
                Err(failure) => {
                    warn!(message_id = %envelope.id, fork = failure.fork, error = %failure.message, "processing fork failed");
                    report.failures.push(failure);
                    continue;
                }
            };
            self.deliver(processed, &active, &mut report);
        }
        report
    }

    fn process(&self, message: Inbound) -> Result<Processed, ForkFailure> {
        match message {
            Inbound::Content(content) => {
                let normalized = run(
                    &Normalizer {
                        profiles: &self.profiles,
                    },
                    content,
                )?;
                let scored = run(
                    &Prioritizer {
                        scorer: &self.scorer,
                    },
                    normalized,
                )?;
                Ok(Processed::Content(scored))
            }
            Inbound::Search(request) => Ok(Processed::Search(request)),
            Inbound::Storage(notice) => Ok(Processed::Storage(notice)),
        }
    }

    fn deliver(&self, processed: Processed, active: &[SessionId], report: &mut RoutingReport) {
        match processed {
            Processed::Content(content) => {
                match run(&Broadcaster, (content.clone(), active.to_vec())) {
                    Ok(Some(notice)) => report.outputs.push(Outbound::SessionBroadcast(notice)),
                    Ok(None) => {}
                    Err(failure) => report.failures.push(failure),
                }

                if !(self.config.backup_enabled && content.priority.backup_required()) {
                    return;
                }
                let backup = run(&Compressor, content).and_then(|compressed| {
                    run(
                        &BackupFork {
                            enabled: self.config.backup_enabled,
                        },
                        compressed,
                    )
                });
                match backup {
                    Ok(Some(record)) => report.outputs.push(Outbound::Backup(record)),
                    Ok(None) => {}
                    Err(failure) => report.failures.push(failure),
                }
            }
            Processed::Search(request) => {
                let assembler = ContextAssembler {
                    max_chars: self.config.context_max_chars,
                };
                match run(&assembler, request) {
                    Ok(delivery) => report.outputs.push(Outbound::ContextDelivery(delivery)),
                    Err(failure) => report.failures.push(failure),
                }
            }
            Processed::Storage(notice) => {
                match run(
                    &RecoveryFork {
                        config: &self.config,
                    },
                    notice,
                ) {
                    Ok(action) => {
                        debug!(operation = ?action.operation, strategy = %action.strategy, "recovery selected");
                        report.outputs.push(Outbound::Recovery(action));
                    }
                    Err(failure) => report.failures.push(failure),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Operation;
    use crate::priority::Priority;
    use crate::recovery::RecoveryStrategy;
    use tessera_core::types::{BlockAddress, EntityMap, FragmentId, SearchHit, ThinTag};

    fn content(session: &str, text: &str) -> ContentMessage {
        ContentMessage {
            fragment_id: FragmentId::from("frag-1"),
            address: BlockAddress { block: 1, chunk: 1 },
            session_id: SessionId::from(session),
            provider_tag: "Claude".to_string(),
            text: text.to_string(),
            summary: None,
            block: text.repeat(40).into_bytes(),
        }
    }

    fn hit(chunk: u32, summary: &str) -> SearchHit {
        let now = Utc::now();
        SearchHit {
            tag: ThinTag {
                address: BlockAddress { block: 1, chunk }.thin(),
                fragment_id: FragmentId::from("f"),
                session_id: SessionId::from("s"),
                provider_tag: "claude".into(),
                topic: None,
                summary: summary.into(),
                keywords: vec!["alpha".into()],
                entities: EntityMap::default(),
                content_hash: String::new(),
                size_bytes: 0,
                created_at: now,
                updated_at: now,
            },
            score: 1.0,
            slot: None,
        }
    }

    #[test]
    fn high_priority_content_is_backed_up_compressed() {
        let mut router = ForkRouter::new(RouterConfig::default());
        let msg = content("s1", "We decided the deadline is Friday for the migration");
        let report = router.route(Envelope::new(Inbound::Content(msg)), Utc::now());
        let backups: Vec<_> = report.backups().collect();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].priority, Priority::High);
        assert!(backups[0].compressed);
        assert!(report.failures.is_empty());
    }

    #[test]
    fn critical_content_is_backed_up_uncompressed() {
        let mut router = ForkRouter::new(RouterConfig::default());
        let msg = content("s1", "the vault password rotates every month for this account");
        let expected = msg.block.clone();
        let report = router.route(Envelope::new(Inbound::Content(msg)), Utc::now());
        let backup = report.backups().next().unwrap();
        assert_eq!(backup.priority, Priority::Critical);
        assert!(!backup.compressed);
        assert_eq!(backup.payload, expected);
    }

    #[test]
    fn medium_content_has_no_backup() {
        let mut router = ForkRouter::new(RouterConfig::default());
        let msg = content("s1", "The layout uses a two column grid for the sidebar");
        let report = router.route(Envelope::new(Inbound::Content(msg)), Utc::now());
        assert_eq!(report.backups().count(), 0);
    }

    #[test]
    fn broadcast_reaches_other_active_sessions() {
        let now = Utc::now();
        let mut router = ForkRouter::new(RouterConfig::default());
        router.touch_session(&SessionId::from("s1"), now);
        router.touch_session(&SessionId::from("s2"), now);
        router.touch_session(&SessionId::from("stale"), now - Duration::hours(2));

        let report = router.route(Envelope::new(Inbound::Content(content("s1", "hello there everyone"))), now);
        let notice = report
            .outputs
            .iter()
            .find_map(|o| match o {
                Outbound::SessionBroadcast(n) => Some(n),
                _ => None,
            })
            .unwrap();
        assert_eq!(notice.recipients, vec![SessionId::from("s2")]);
    }

    #[test]
    fn duplicate_ids_are_delivered_once_per_pass() {
        let mut router = ForkRouter::new(RouterConfig::default());
        let msg = Inbound::Content(content("s1", "We decided the deadline is Friday"));
        let report = router.route_pass(
            vec![
                Envelope::with_id("m1", msg.clone()),
                Envelope::with_id("m1", msg),
            ],
            Utc::now(),
        );
        assert_eq!(report.backups().count(), 1);
        assert_eq!(report.duplicates, vec![MessageId("m1".into())]);
    }

    #[test]
    fn missing_provider_fails_only_that_message() {
        let mut router = ForkRouter::new(RouterConfig::default());
        let mut bad = content("s1", "We decided the deadline is Friday");
        bad.provider_tag = String::new();
        let good = content("s1", "We decided the deadline is Friday");
        let report = router.route_pass(
            vec![
                Envelope::new(Inbound::Content(bad)),
                Envelope::new(Inbound::Content(good)),
            ],
            Utc::now(),
        );
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].fork, "normalize");
        assert_eq!(report.backups().count(), 1);
    }

    #[test]
    fn oversized_text_is_truncated_on_char_boundary() {
        let mut config = RouterConfig::default();
        config.providers.insert(
            "claude".into(),
            tessera_config::model::ProviderProfileConfig {
                max_size_bytes: 5,
                compress: true,
                priority_bias: 0,
            },
        );
        let router = ForkRouter::new(config);
        let normalized = run(
            &Normalizer {
                profiles: &router.profiles,
            },
            content("s1", "héllo wörld"),
        )
        .unwrap();
        assert_eq!(normalized.0.text, "héll");
        assert!(normalized.2);
    }

    #[test]
    fn truncate_bytes_counts_bytes_not_chars() {
        // "é" is two bytes: a 2-byte budget keeps only "h".
        assert_eq!(truncate_bytes("héllo", 2), ("h", true));
        assert_eq!(truncate_bytes("héllo", 3), ("hé", true));
        assert_eq!(truncate_bytes("héllo", 6), ("héllo", false));
    }

    #[test]
    fn context_delivery_respects_char_budget() {
        let config = RouterConfig {
            context_max_chars: 60,
            ..RouterConfig::default()
        };
        let mut router = ForkRouter::new(config);
        let request = SearchRequest {
            session_id: None,
            query: "alpha".into(),
            hits: vec![hit(1, "first summary"), hit(2, "second summary"), hit(3, "third")],
        };
        let report = router.route(Envelope::new(Inbound::Search(request)), Utc::now());
        match &report.outputs[0] {
            Outbound::ContextDelivery(delivery) => {
                assert!(delivery.text.chars().count() <= 60);
                assert_eq!(delivery.addresses.len(), 1);
                assert!(delivery.truncated);
            }
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn storage_failure_yields_recovery_action() {
        let mut router = ForkRouter::new(RouterConfig::default());
        let notice = StorageNotice {
            operation: Operation::Retrieve,
            fragment_id: None,
            address: Some(BlockAddress { block: 1, chunk: 2 }),
            kind: ErrorKind::DecryptionFailed,
            message: "no key".into(),
        };
        let report = router.route(Envelope::new(Inbound::Storage(notice)), Utc::now());
        let action = report.recoveries().next().unwrap();
        assert_eq!(action.strategy, RecoveryStrategy::CacheClearAndRetry);
    }

    #[test]
    fn panicking_fork_is_isolated() {
        struct Exploding;
        impl Fork for Exploding {
            type Input = ();
            type Output = ();
            fn name(&self) -> &'static str {
                "exploding"
            }
            fn handle(&self, _: ()) -> Result<(), ForkFailure> {
                panic!("boom")
            }
        }
        let failure = run(&Exploding, ()).unwrap_err();
        assert!(failure.panicked);
        assert_eq!(failure.message, "boom");
        assert_eq!(failure.kind, ErrorKind::RoutingFailure);
    }
}
