//! Downloading source documents from the S3-compatible object store.
//!
//! The store is configured with a fixed bucket; callers only supply object
//! keys. Bodies are streamed to disk chunk by chunk, never buffered whole.
//! Dev environments run self-signed endpoints, so certificate verification
//! can be switched off via config.

use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::{config::Region, error::SdkError, operation::get_object::GetObjectError};
use aws_smithy_runtime::client::http::hyper_014::HyperClientBuilder;
use tokio::{fs::File, io::AsyncWriteExt as _};

use crate::{
    config::Settings,
    errors::{ErrorCode, PipelineError},
    prelude::*,
};

/// Metadata returned along with the downloaded file.
#[derive(Clone, Debug)]
pub struct FetchedObject {
    pub path: PathBuf,
    pub size: u64,
    pub content_type: Option<String>,
    pub etag: Option<String>,
}

/// Client for the configured document bucket.
#[derive(Clone, Debug)]
pub struct ObjectFetcher {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl ObjectFetcher {
    /// Build the fetcher from settings. The region string is always
    /// non-empty: the request signature requires one even though the
    /// server never checks its value.
    pub fn new(settings: &Settings) -> Self {
        let credentials = Credentials::new(
            settings.s3_access_key.clone(),
            settings.s3_secret_key.clone(),
            None,
            None,
            "docverify",
        );
        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(settings.s3_region.clone()))
            .endpoint_url(settings.s3_endpoint.clone())
            .credentials_provider(credentials)
            .force_path_style(true);
        if !settings.s3_verify_tls {
            warn!("S3 TLS certificate verification is disabled");
            builder = builder.http_client(insecure_http_client());
        }
        Self {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
            bucket: settings.s3_bucket.clone(),
        }
    }

    /// Download `key` into `dest`, streaming to disk.
    #[instrument(level = "debug", skip(self))]
    pub async fn fetch(&self, key: &str, dest: &Path) -> Result<FetchedObject, PipelineError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| classify_get_error(key, err))?;

        let content_type = output.content_type().map(str::to_owned);
        let etag = output.e_tag().map(str::to_owned);

        let mut file = File::create(dest).await.map_err(|err| {
            PipelineError::new(
                ErrorCode::FileSaveFailed,
                format!("failed to create {:?}", dest),
            )
            .with_cause(err.into())
        })?;

        let mut body = output.body;
        let mut size: u64 = 0;
        loop {
            let chunk = body.try_next().await.map_err(|err| {
                PipelineError::new(
                    ErrorCode::S3Error,
                    format!("failed reading object body for {:?}", key),
                )
                .with_cause(err.into())
            })?;
            let Some(chunk) = chunk else { break };
            size += chunk.len() as u64;
            file.write_all(&chunk).await.map_err(|err| {
                PipelineError::new(
                    ErrorCode::FileSaveFailed,
                    format!("failed writing {:?}", dest),
                )
                .with_cause(err.into())
            })?;
        }
        file.flush().await.map_err(|err| {
            PipelineError::new(ErrorCode::FileSaveFailed, "failed to flush download")
                .with_cause(err.into())
        })?;

        debug!(key, size, "object downloaded");
        Ok(FetchedObject {
            path: dest.to_owned(),
            size,
            content_type,
            etag,
        })
    }
}

/// Map an S3 GET failure onto the error taxonomy.
fn classify_get_error(key: &str, err: SdkError<GetObjectError>) -> PipelineError {
    match &err {
        SdkError::ServiceError(service_err) => {
            if service_err.err().is_no_such_key() {
                return PipelineError::new(
                    ErrorCode::ResourceNotFound,
                    format!("object {:?} not found", key),
                );
            }
            let status = service_err.raw().status().as_u16();
            // Credential and permission failures will not resolve on retry.
            let retryable = !matches!(status, 401 | 403);
            let error = PipelineError::new(
                ErrorCode::S3Error,
                format!("object store returned HTTP {} for {:?}", status, key),
            )
            .with_cause(anyhow!("{}", err));
            if retryable { error.retryable() } else { error.not_retryable() }
        }
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            PipelineError::new(
                ErrorCode::S3Error,
                format!("object store transport failure for {:?}", key),
            )
            .with_cause(anyhow!("{}", err))
            .retryable()
        }
        _ => PipelineError::new(
            ErrorCode::S3Error,
            format!("object store failure for {:?}", key),
        )
        .with_cause(anyhow!("{}", err))
        .not_retryable(),
    }
}

/// An HTTP client that accepts any server certificate. Dev-only; selected
/// by `S3_VERIFY_TLS=false`.
fn insecure_http_client() -> aws_smithy_runtime_api::client::http::SharedHttpClient {
    let tls_config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    let connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();
    HyperClientBuilder::new().build(connector)
}

#[derive(Debug)]
struct AcceptAnyServerCert;

impl rustls::client::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}
