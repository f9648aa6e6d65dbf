use crate::error::HandlerError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Url;
use sha2::Sha256;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};

const STORAGE_API_VERSION: &str = "2018-03-28";
const USER_AGENT: &str = concat!("script-handler/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageCredentials {
    pub account_name: String,
    pub account_key: String,
}

/// One remote file to fetch, in configuration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTarget {
    pub index: usize,
    pub url: String,
    pub credentials: Option<StorageCredentials>,
}

pub trait Fetcher {
    /// Downloads `target` into `dir` and returns the written file.
    fn fetch(&self, target: &DownloadTarget, dir: &Path) -> Result<PathBuf, HandlerError>;
}

pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, HandlerError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(None::<Duration>)
            .build()?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, target: &DownloadTarget, dir: &Path) -> Result<PathBuf, HandlerError> {
        let url = Url::parse(&target.url)
            .map_err(|err| HandlerError::Config(format!("invalid URL {}: {err}", target.url)))?;
        let dest = dir.join(file_name_for(&url)?);

        let mut request = self.client.get(url.clone());
        if let Some(creds) = &target.credentials {
            let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
            let auth = shared_key_authorization(creds, "GET", &url, &date, STORAGE_API_VERSION)?;
            request = request
                .header("x-ms-date", date)
                .header("x-ms-version", STORAGE_API_VERSION)
                .header("Authorization", auth);
        }
        let mut response = request.send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(HandlerError::Process(format!(
                "download failed: {} (HTTP {})",
                url.path(),
                status
            )));
        }
        let mut file = fs::File::create(&dest)?;
        response.copy_to(&mut file)?;
        Ok(dest)
    }
}

/// The file keeps the last segment of the URL path as its name.
fn file_name_for(url: &Url) -> Result<String, HandlerError> {
    url.path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .filter(|name| *name != "." && *name != "..")
        .map(str::to_string)
        .ok_or_else(|| {
            HandlerError::Config(format!("cannot derive a file name from {}", url.path()))
        })
}

/// Canonical string the Shared Key scheme signs for a bodiless request.
fn string_to_sign(account: &str, method: &str, url: &Url, date: &str, version: &str) -> String {
    let mut resource = format!("/{}{}", account, url.path());
    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.to_lowercase(), v.into_owned()))
        .collect();
    params.sort();
    let mut i = 0;
    while i < params.len() {
        let name = params[i].0.clone();
        let mut values = Vec::new();
        while i < params.len() && params[i].0 == name {
            values.push(params[i].1.clone());
            i += 1;
        }
        resource.push_str(&format!("\n{}:{}", name, values.join(",")));
    }

    // Eleven standard headers are empty for a bodiless GET.
    format!("{method}\n\n\n\n\n\n\n\n\n\n\n\nx-ms-date:{date}\nx-ms-version:{version}\n{resource}")
}

/// Builds the `SharedKey` authorization header for an Azure blob request without a body.
fn shared_key_authorization(
    creds: &StorageCredentials,
    method: &str,
    url: &Url,
    date: &str,
    version: &str,
) -> Result<String, HandlerError> {
    let key = STANDARD.decode(creds.account_key.trim()).map_err(|err| {
        HandlerError::Config(format!("storageAccountKey is not valid base64: {err}"))
    })?;
    let mut mac = Hmac::<Sha256>::new_from_slice(&key)
        .map_err(|err| HandlerError::Config(format!("unusable storage account key: {err}")))?;
    mac.update(string_to_sign(&creds.account_name, method, url, date, version).as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());
    Ok(format!("SharedKey {}:{}", creds.account_name, signature))
}

fn create_output_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(dir)
    }
}

/// Creates `dir` and fetches every target into it in order.
///
/// Stops at the first failure; files already written stay on disk.
pub fn download_files(
    fetcher: &dyn Fetcher,
    dir: &Path,
    targets: &[DownloadTarget],
) -> Result<Vec<PathBuf>, HandlerError> {
    info!(event = "creating output directory", path = %dir.display());
    create_output_dir(dir)
        .map_err(|err| HandlerError::state_dir("failed to prepare output directory", err))?;
    info!(event = "created output directory", path = %dir.display());

    info!(files = targets.len());
    let mut written = Vec::with_capacity(targets.len());
    for target in targets {
        info!(event = "download start", file = target.index);
        match fetcher.fetch(target, dir) {
            Ok(path) => {
                info!(event = "download complete", file = target.index, output = %path.display());
                written.push(path);
            }
            Err(err) => {
                error!(event = "download failed", file = target.index, error = %err);
                return Err(HandlerError::Download {
                    index: target.index,
                    message: err.to_string(),
                });
            }
        }
    }
    Ok(written)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;
    use tempfile::tempdir;

    /// Writes the URL into a file named after it and records every attempt.
    #[derive(Default)]
    pub(crate) struct RecordingFetcher {
        pub attempts: RefCell<Vec<usize>>,
        pub fail_at: Option<usize>,
    }

    impl Fetcher for RecordingFetcher {
        fn fetch(&self, target: &DownloadTarget, dir: &Path) -> Result<PathBuf, HandlerError> {
            self.attempts.borrow_mut().push(target.index);
            if self.fail_at == Some(target.index) {
                return Err(HandlerError::Process("HTTP 404 Not Found".to_string()));
            }
            let url = Url::parse(&target.url).unwrap();
            let path = dir.join(file_name_for(&url)?);
            fs::write(&path, &target.url)?;
            Ok(path)
        }
    }

    fn targets(n: usize) -> Vec<DownloadTarget> {
        (0..n)
            .map(|index| DownloadTarget {
                index,
                url: format!("https://example.invalid/files/{index}.sh"),
                credentials: None,
            })
            .collect()
    }

    #[test]
    fn fetches_in_order_into_created_dir() {
        let root = tempdir().unwrap();
        let dir = root.path().join("download").join("3");
        let fetcher = RecordingFetcher::default();

        let written = download_files(&fetcher, &dir, &targets(3)).unwrap();

        assert_eq!(*fetcher.attempts.borrow(), vec![0, 1, 2]);
        assert_eq!(written.len(), 3);
        assert!(dir.join("2.sh").exists());
    }

    #[test]
    fn stops_at_first_failure_and_names_index() {
        let root = tempdir().unwrap();
        let dir = root.path().join("out");
        let fetcher = RecordingFetcher {
            fail_at: Some(1),
            ..Default::default()
        };

        let err = download_files(&fetcher, &dir, &targets(4)).unwrap_err();

        assert!(matches!(err, HandlerError::Download { index: 1, .. }));
        assert!(err.to_string().contains("file[1]"));
        assert_eq!(*fetcher.attempts.borrow(), vec![0, 1]);
        assert!(dir.join("0.sh").exists());
        assert!(!dir.join("2.sh").exists());
    }

    #[test]
    fn existing_dir_and_siblings_are_kept() {
        let root = tempdir().unwrap();
        let dir = root.path().join("download").join("5");
        let sibling = root.path().join("download").join("4");
        fs::create_dir_all(&dir).unwrap();
        fs::create_dir_all(&sibling).unwrap();

        download_files(&RecordingFetcher::default(), &dir, &[]).unwrap();

        assert!(sibling.exists());
    }

    #[cfg(unix)]
    #[test]
    fn output_dir_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let root = tempdir().unwrap();
        let dir = root.path().join("private");
        download_files(&RecordingFetcher::default(), &dir, &[]).unwrap();
        let mode = fs::metadata(&dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
    }

    #[test]
    fn file_name_uses_last_path_segment() {
        let url = Url::parse("https://acct.blob.core.windows.net/c/dir/run.sh?sv=1").unwrap();
        assert_eq!(file_name_for(&url).unwrap(), "run.sh");
        let url = Url::parse("https://host/dir/").unwrap();
        assert_eq!(file_name_for(&url).unwrap(), "dir");
        let url = Url::parse("https://host/").unwrap();
        assert!(file_name_for(&url).is_err());
    }

    #[test]
    fn string_to_sign_canonicalizes_resource() {
        let url = Url::parse(
            "https://acct.blob.core.windows.net/c/dir/run.sh?restype=container&comp=meta&Comp=list",
        )
        .unwrap();
        let signed = string_to_sign(
            "acct",
            "GET",
            &url,
            "Mon, 02 Jan 2006 15:04:05 GMT",
            STORAGE_API_VERSION,
        );
        assert_eq!(
            signed,
            "GET\n\n\n\n\n\n\n\n\n\n\n\n\
             x-ms-date:Mon, 02 Jan 2006 15:04:05 GMT\n\
             x-ms-version:2018-03-28\n\
             /acct/c/dir/run.sh\n\
             comp:list,meta\n\
             restype:container"
        );
    }

    #[test]
    fn shared_key_header_matches_known_signature() {
        let creds = StorageCredentials {
            account_name: "acct".to_string(),
            account_key: "c2VjcmV0LWtleQ==".to_string(),
        };
        let url = Url::parse(
            "https://acct.blob.core.windows.net/c/dir/run.sh?restype=container&comp=meta&Comp=list",
        )
        .unwrap();
        let header = shared_key_authorization(
            &creds,
            "GET",
            &url,
            "Mon, 02 Jan 2006 15:04:05 GMT",
            STORAGE_API_VERSION,
        )
        .unwrap();
        assert_eq!(
            header,
            "SharedKey acct:TGNca/qmPGGf5buKasgF+Gfs87W01iddH578xWkKltQ="
        );
    }

    #[test]
    fn shared_key_rejects_non_base64_key() {
        let creds = StorageCredentials {
            account_name: "acct".to_string(),
            account_key: "not base64!".to_string(),
        };
        let url = Url::parse("https://acct.blob.core.windows.net/c/run.sh").unwrap();
        assert!(shared_key_authorization(&creds, "GET", &url, "d", STORAGE_API_VERSION).is_err());
    }
}
