use crate::download::{DownloadTarget, StorageCredentials};
use crate::error::HandlerError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::Value;
use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::info;

pub const HANDLER_ENV_FILE: &str = "HandlerEnvironment.json";
pub const CERT_DIR_ENV: &str = "SCRIPT_HANDLER_CERT_DIR";
const DEFAULT_CERT_DIR: &str = "/var/lib/waagent";

/// Folders the host hands to the extension.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct HandlerFolders {
    pub log_folder: PathBuf,
    pub config_folder: PathBuf,
    pub status_folder: PathBuf,
    #[serde(default)]
    pub heartbeat_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct HandlerEnvironment {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: f64,
    #[serde(rename = "handlerEnvironment")]
    pub folders: HandlerFolders,
}

impl HandlerEnvironment {
    pub fn load(path: &Path) -> Result<Self, HandlerError> {
        let content = fs::read_to_string(path).map_err(|err| {
            HandlerError::Config(format!(
                "cannot read handler environment {}: {err}",
                path.display()
            ))
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, HandlerError> {
        let mut entries: Vec<HandlerEnvironment> = serde_json::from_str(content)?;
        if entries.is_empty() {
            return Err(HandlerError::Config(
                "handler environment holds no entries".to_string(),
            ));
        }
        Ok(entries.swap_remove(0))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsFile {
    runtime_settings: Vec<RuntimeSettings>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RuntimeSettings {
    handler_settings: RawHandlerSettings,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHandlerSettings {
    #[serde(default)]
    protected_settings_cert_thumbprint: Option<String>,
    #[serde(default)]
    protected_settings: Option<Value>,
    #[serde(default)]
    public_settings: Option<Value>,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct PublicSettings {
    pub file_uris: Vec<String>,
    pub command_to_execute: String,
    pub timestamp: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct ProtectedSettings {
    pub command_to_execute: String,
    pub storage_account_name: String,
    pub storage_account_key: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerSettings {
    pub public: PublicSettings,
    pub protected: ProtectedSettings,
}

impl HandlerSettings {
    /// The public command wins when set; otherwise the protected one is used.
    pub fn command(&self) -> &str {
        if self.public.command_to_execute.is_empty() {
            &self.protected.command_to_execute
        } else {
            &self.public.command_to_execute
        }
    }

    pub fn credentials(&self) -> Option<StorageCredentials> {
        if self.protected.storage_account_name.is_empty() {
            return None;
        }
        Some(StorageCredentials {
            account_name: self.protected.storage_account_name.clone(),
            account_key: self.protected.storage_account_key.clone(),
        })
    }

    pub fn download_targets(&self) -> Vec<DownloadTarget> {
        let credentials = self.credentials();
        self.public
            .file_uris
            .iter()
            .enumerate()
            .map(|(index, url)| DownloadTarget {
                index,
                url: url.clone(),
                credentials: credentials.clone(),
            })
            .collect()
    }

    pub fn validate(&self) -> Result<(), HandlerError> {
        let public_cmd = !self.public.command_to_execute.trim().is_empty();
        let protected_cmd = !self.protected.command_to_execute.trim().is_empty();
        match (public_cmd, protected_cmd) {
            (true, true) => {
                return Err(HandlerError::Config(
                    "commandToExecute is specified in both public and protected settings"
                        .to_string(),
                ))
            }
            (false, false) => {
                return Err(HandlerError::Config(
                    "commandToExecute is not specified in public or protected settings"
                        .to_string(),
                ))
            }
            _ => {}
        }
        if self.protected.storage_account_name.is_empty()
            != self.protected.storage_account_key.is_empty()
        {
            return Err(HandlerError::Config(
                "storageAccountName and storageAccountKey must be specified together".to_string(),
            ));
        }
        for (i, uri) in self.public.file_uris.iter().enumerate() {
            let parsed = reqwest::Url::parse(uri).map_err(|err| {
                HandlerError::Config(format!("fileUris[{i}] is not a valid URL: {err}"))
            })?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                return Err(HandlerError::Config(format!(
                    "fileUris[{i}] must use http or https, got {}",
                    parsed.scheme()
                )));
            }
        }
        Ok(())
    }
}

pub fn cert_dir() -> PathBuf {
    env::var(CERT_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CERT_DIR))
}

/// Reads `<config_folder>/<seq>.settings`, decrypts protected settings and validates the result.
pub fn parse_and_validate(
    config_folder: &Path,
    seq: u64,
    cert_dir: &Path,
) -> Result<HandlerSettings, HandlerError> {
    let path = config_folder.join(format!("{seq}.settings"));
    info!(event = "reading settings", path = %path.display());
    let content = fs::read_to_string(&path).map_err(|err| {
        HandlerError::Config(format!("cannot read settings {}: {err}", path.display()))
    })?;
    let settings = parse_settings(&content, cert_dir)?;
    settings.validate()?;
    info!(
        event = "validated settings",
        files = settings.public.file_uris.len(),
        timestamp = ?settings.public.timestamp
    );
    Ok(settings)
}

pub fn parse_settings(content: &str, cert_dir: &Path) -> Result<HandlerSettings, HandlerError> {
    let file: SettingsFile = serde_json::from_str(content)?;
    let Some(runtime) = file.runtime_settings.into_iter().next() else {
        return Err(HandlerError::Config(
            "settings hold no runtimeSettings entries".to_string(),
        ));
    };
    let raw = runtime.handler_settings;

    let public = match raw.public_settings {
        None | Some(Value::Null) => PublicSettings::default(),
        Some(value) => serde_json::from_value(value)
            .map_err(|err| HandlerError::Config(format!("invalid public settings: {err}")))?,
    };
    let protected_value = match raw.protected_settings {
        None | Some(Value::Null) => Value::Null,
        Some(Value::String(encoded)) if encoded.is_empty() => Value::Null,
        Some(Value::String(encoded)) => {
            let thumbprint = raw.protected_settings_cert_thumbprint.unwrap_or_default();
            decrypt_protected_settings(&encoded, &thumbprint, cert_dir)?
        }
        Some(value) => value,
    };
    let protected = match protected_value {
        Value::Null => ProtectedSettings::default(),
        value => serde_json::from_value(value)
            .map_err(|err| HandlerError::Config(format!("invalid protected settings: {err}")))?,
    };
    Ok(HandlerSettings { public, protected })
}

/// Decrypts the base64 PKCS#7 envelope with the certificate the host dropped for `thumbprint`.
fn decrypt_protected_settings(
    encoded: &str,
    thumbprint: &str,
    cert_dir: &Path,
) -> Result<Value, HandlerError> {
    if thumbprint.is_empty() {
        return Err(HandlerError::Config(
            "protected settings are encrypted but no certificate thumbprint is given".to_string(),
        ));
    }
    let envelope = STANDARD
        .decode(encoded.trim())
        .map_err(|err| HandlerError::Config(format!("protected settings are not base64: {err}")))?;
    let openssl = which::which("openssl").map_err(|_| {
        HandlerError::Process("openssl is required to decrypt protected settings".to_string())
    })?;
    let crt = cert_dir.join(format!("{thumbprint}.crt"));
    let prv = cert_dir.join(format!("{thumbprint}.prv"));
    let mut child = Command::new(openssl)
        .args(["smime", "-inform", "DER", "-decrypt", "-recip"])
        .arg(&crt)
        .arg("-inkey")
        .arg(&prv)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| HandlerError::Process(format!("failed to launch openssl: {err}")))?;
    // openssl may exit before reading everything (missing key); its stderr says why.
    let write_err = child
        .stdin
        .take()
        .and_then(|mut stdin| stdin.write_all(&envelope).err());
    let output = child.wait_with_output()?;
    if !output.status.success() {
        return Err(HandlerError::Process(format!(
            "failed to decrypt protected settings ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    if let Some(err) = write_err {
        return Err(HandlerError::Process(format!(
            "failed to pass protected settings to openssl: {err}"
        )));
    }
    serde_json::from_slice(&output.stdout)
        .map_err(|err| HandlerError::Config(format!("decrypted protected settings: {err}")))
}
