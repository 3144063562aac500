use crate::{Context, ImportError, JobDescriptor};

use super::{tls, SourceReader, SourceStream};

/// Source for public HTTP(S) endpoints.
pub(crate) struct HttpSource {
    agent: ureq::Agent,
    url: String,
    credentials: Option<(String, String)>,
}

impl HttpSource {
    pub fn new(job: &JobDescriptor) -> Result<Self, ImportError> {
        let url = url::Url::parse(&job.endpoint)
            .map_err(|e| ImportError::SourceUnavailable(format!("{:?}: {e}", job.endpoint)))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(ImportError::SourceUnavailable(format!(
                "unsupported URL scheme: {}",
                url.scheme()
            )));
        }

        Ok(HttpSource {
            agent: tls::agent(job.cert_dir.as_deref(), job.insecure_tls)?,
            url: url.into(),
            credentials: job.access_key.clone().zip(job.secret_key.clone()),
        })
    }
}

impl SourceReader for HttpSource {
    fn open(&mut self, ctx: &Context) -> Result<SourceStream, ImportError> {
        let _enter = ctx.span.enter();
        tracing::info!(url = %self.url, "Requesting image.");

        let mut request = self.agent.get(&self.url);
        if let Some((user, password)) = &self.credentials {
            request = request.set("Authorization", &basic_auth(user, password));
        }

        let response = request
            .call()
            .map_err(|e| tls::request_error(&self.url, e))?;

        let length = tls::content_length(&response);
        tracing::debug!(status = response.status(), length, "Response received.");

        Ok(SourceStream {
            reader: Box::new(response.into_reader()),
            length,
        })
    }
}

/// Build the value for an `Authorization: Basic` header.
pub(crate) fn basic_auth(user: &str, password: &str) -> String {
    use base64::Engine as _;

    let credentials = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"));
    format!("Basic {credentials}")
}

#[test]
fn encode_basic_auth() {
    assert_eq!(basic_auth("Aladdin", "open sesame"), "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==");
    assert_eq!(basic_auth("a", "b"), "Basic YTpi");
    assert_eq!(basic_auth("ab", "c"), "Basic YWI6Yw==");
}
