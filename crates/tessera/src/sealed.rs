// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Passphrase-sealed config files: `tessera config seal`/`unseal` and
//! transparent opening of a sealed `--config` file.

use std::path::Path;

use secrecy::SecretString;
use tracing::info;

use tessera_config::model::TesseraConfig;
use tessera_config::ConfigError;
use tessera_core::TesseraError;
use tessera_crypto::kdf::KdfParams;
use tessera_crypto::sealed_config;

/// Environment variable holding the config passphrase. Kept apart from the
/// key passphrase so a sealed config can be shipped without the key secret.
pub const CONFIG_PASSPHRASE_ENV: &str = "TESSERA_CONFIG_PASSPHRASE";

fn passphrase() -> Option<SecretString> {
    std::env::var(CONFIG_PASSPHRASE_ENV)
        .ok()
        .filter(|value| !value.is_empty())
        .map(SecretString::from)
}

/// Load `path`, opening it first when it is sealed.
pub fn load_config(path: &Path) -> Result<TesseraConfig, Vec<ConfigError>> {
    let origin = path.display().to_string();
    let sealed_error = |message: String| {
        vec![ConfigError::Sealed {
            path: origin.clone(),
            message,
        }]
    };
    let bytes = match std::fs::read(path) {
        Ok(bytes) if sealed_config::is_sealed(&bytes) => bytes,
        // Plain TOML, or a missing file that figment reports itself.
        _ => return tessera_config::load_and_validate_path(path),
    };
    let Some(passphrase) = passphrase() else {
        return Err(sealed_error(format!("{CONFIG_PASSPHRASE_ENV} is not set")));
    };
    let plain = sealed_config::open(&bytes, &passphrase).map_err(|e| sealed_error(e.to_string()))?;
    let text = std::str::from_utf8(&plain)
        .map_err(|_| sealed_error("sealed content is not UTF-8 TOML".to_string()))?;
    tessera_config::load_and_validate_document(&origin, text)
}

/// Seal the TOML at `input` into `output` with the `[crypto]` KDF costs.
/// The input must itself be a valid configuration.
pub fn run_seal(config: &TesseraConfig, input: &Path, output: &Path) -> Result<(), TesseraError> {
    let passphrase = passphrase()
        .ok_or_else(|| TesseraError::Config(format!("{CONFIG_PASSPHRASE_ENV} is not set")))?;
    let text = std::fs::read_to_string(input)
        .map_err(|e| TesseraError::Config(format!("cannot read {}: {e}", input.display())))?;
    if sealed_config::is_sealed(text.as_bytes()) {
        return Err(TesseraError::Config(format!("{} is already sealed", input.display())));
    }
    if let Err(errors) = tessera_config::load_and_validate_str(&text) {
        tessera_config::render_errors(&errors);
        return Err(TesseraError::Config(format!(
            "{} is not a valid configuration",
            input.display()
        )));
    }
    let params = KdfParams::from_config(&config.crypto)?;
    let sealed = sealed_config::seal(text.as_bytes(), &passphrase, &params)?;
    std::fs::write(output, sealed)
        .map_err(|e| TesseraError::Config(format!("cannot write {}: {e}", output.display())))?;
    info!(input = %input.display(), output = %output.display(), "sealed configuration");
    Ok(())
}

/// Open the sealed file at `input` and return its TOML text.
pub fn unseal(input: &Path) -> Result<String, TesseraError> {
    let passphrase = passphrase()
        .ok_or_else(|| TesseraError::Config(format!("{CONFIG_PASSPHRASE_ENV} is not set")))?;
    let bytes = std::fs::read(input)
        .map_err(|e| TesseraError::Config(format!("cannot read {}: {e}", input.display())))?;
    let plain = sealed_config::open(&bytes, &passphrase)?;
    String::from_utf8(plain.to_vec())
        .map_err(|_| TesseraError::Config("sealed content is not UTF-8".to_string()))
}
