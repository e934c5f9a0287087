//! HTTP client for a Blossom server.

use std::sync::{Mutex, MutexGuard, PoisonError};

use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use url::Url;

use crate::error::{Error, Result};
use crate::keys::Signer;

use super::auth::{
    authorization_header, delete_authorization, list_authorization, upload_authorization,
};
use super::{BlobDescriptor, ServerDescriptor, WELL_KNOWN_PATH, sha256_hex};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Client for one Blossom server.
///
/// Downloads re-verify the SHA-256 of the body; a mismatching server
/// response never reaches the caller.
pub struct BlossomClient {
    http: reqwest::Client,
    server: Url,
    descriptor: Mutex<Option<ServerDescriptor>>,
}

impl BlossomClient {
    pub fn new(server: &str) -> Result<Self> {
        let mut server =
            Url::parse(server).map_err(|e| Error::InvalidUrl(format!("{server}: {e}")))?;
        match server.scheme() {
            "http" | "https" => {}
            other => {
                return Err(Error::InvalidUrl(format!(
                    "{server}: unsupported scheme {other:?}"
                )));
            }
        }
        // Keep a trailing slash so joins append instead of replacing.
        if !server.path().ends_with('/') {
            server.set_path(&format!("{}/", server.path()));
        }
        Ok(Self {
            http: reqwest::Client::new(),
            server,
            descriptor: Mutex::new(None),
        })
    }

    /// Fetch `/.well-known/blossom` and remember it for endpoint resolution.
    pub async fn discover(&self) -> Result<ServerDescriptor> {
        let url = self.join(WELL_KNOWN_PATH)?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::TransportIo(e.to_string()))?;
        check_status(response.status())?;
        let descriptor: ServerDescriptor = response
            .json()
            .await
            .map_err(|e| Error::TransportIo(e.to_string()))?;
        *lock(&self.descriptor) = Some(descriptor.clone());
        Ok(descriptor)
    }

    /// Upload raw bytes. The server's descriptor must echo the SHA-256 of
    /// the body.
    pub async fn upload(
        &self,
        signer: &dyn Signer,
        bytes: Vec<u8>,
        mime: Option<&str>,
    ) -> Result<BlobDescriptor> {
        let sha = sha256_hex(&bytes);
        let auth = upload_authorization(signer, &sha, bytes.len() as u64, mime, None)?;
        let url = self.endpoint(|d| d.upload_url.as_deref(), "upload")?;

        let mut request = self
            .http
            .put(url)
            .header(AUTHORIZATION, authorization_header(&auth))
            .body(bytes);
        if let Some(mime) = mime {
            request = request.header(CONTENT_TYPE, mime);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::TransportIo(e.to_string()))?;
        check_status(response.status())?;
        let descriptor: BlobDescriptor = response
            .json()
            .await
            .map_err(|e| Error::TransportIo(e.to_string()))?;
        if !descriptor.sha256.eq_ignore_ascii_case(&sha) {
            return Err(Error::BlobHashMismatch);
        }
        Ok(descriptor)
    }

    /// Download a blob and verify its bytes hash to `sha256`.
    pub async fn download(&self, sha256: &str) -> Result<Vec<u8>> {
        let url = self.join(sha256)?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::TransportIo(e.to_string()))?;
        check_status(response.status())?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::TransportIo(e.to_string()))?;
        if !sha256_hex(&bytes).eq_ignore_ascii_case(sha256) {
            return Err(Error::BlobHashMismatch);
        }
        Ok(bytes.to_vec())
    }

    /// Delete a blob by hash.
    pub async fn delete(&self, signer: &dyn Signer, sha256: &str) -> Result<()> {
        let auth = delete_authorization(signer, sha256)?;
        // Default endpoint is `{server}/{sha256}`; a discovered delete_url
        // becomes the base the hash is appended to.
        let custom = lock(&self.descriptor)
            .as_ref()
            .and_then(|d| d.delete_url.clone());
        let url = match custom {
            Some(custom) => {
                let mut base = self.resolve(&custom)?;
                if !base.path().ends_with('/') {
                    base.set_path(&format!("{}/", base.path()));
                }
                base.join(sha256)
                    .map_err(|e| Error::InvalidUrl(format!("{sha256}: {e}")))?
            }
            None => self.join(sha256)?,
        };
        let response = self
            .http
            .delete(url)
            .header(AUTHORIZATION, authorization_header(&auth))
            .send()
            .await
            .map_err(|e| Error::TransportIo(e.to_string()))?;
        check_status(response.status())
    }

    /// List the signer's blobs, optionally bounded by upload time.
    pub async fn list(
        &self,
        signer: &dyn Signer,
        since: Option<u64>,
        until: Option<u64>,
    ) -> Result<Vec<BlobDescriptor>> {
        let auth = list_authorization(signer, since, until)?;
        let mut url = self.endpoint(|d| d.list_url.as_deref(), "list")?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(since) = since {
                query.append_pair("since", &since.to_string());
            }
            if let Some(until) = until {
                query.append_pair("until", &until.to_string());
            }
        }
        let response = self
            .http
            .get(url)
            .header(AUTHORIZATION, authorization_header(&auth))
            .send()
            .await
            .map_err(|e| Error::TransportIo(e.to_string()))?;
        check_status(response.status())?;
        response
            .json()
            .await
            .map_err(|e| Error::TransportIo(e.to_string()))
    }

    // --- internal ---

    fn join(&self, path: &str) -> Result<Url> {
        self.server
            .join(path)
            .map_err(|e| Error::InvalidUrl(format!("{path}: {e}")))
    }

    /// Resolve an operation endpoint: the discovered descriptor's URL if
    /// any (absolute or server-relative), otherwise the default path.
    fn endpoint(
        &self,
        pick: impl Fn(&ServerDescriptor) -> Option<&str>,
        default_path: &str,
    ) -> Result<Url> {
        let custom = lock(&self.descriptor)
            .as_ref()
            .and_then(|d| pick(d).map(str::to_string));
        match custom {
            Some(custom) => self.resolve(&custom),
            None => self.join(default_path),
        }
    }

    fn resolve(&self, location: &str) -> Result<Url> {
        if location.starts_with("http://") || location.starts_with("https://") {
            Url::parse(location).map_err(|e| Error::InvalidUrl(format!("{location}: {e}")))
        } else {
            self.join(location.trim_start_matches('/'))
        }
    }
}

fn check_status(status: StatusCode) -> Result<()> {
    match status.as_u16() {
        200 | 201 | 204 => Ok(()),
        401 | 403 => Err(Error::Unauthorized),
        404 => Err(Error::NotFound),
        429 => Err(Error::RateLimited),
        code => Err(Error::ServerError(code)),
    }
}
