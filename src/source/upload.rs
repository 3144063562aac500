//! Source for data pushed by an external uploader.
//!
//! The importer listens on a local address and waits for a single `PUT`
//! or `POST` request. Its body is the image. The response is sent after
//! the whole body has been consumed.

use std::io::{self, Read};

use tiny_http::{Method, Request, Response, Server};

use crate::{Context, ImportError, JobDescriptor};

use super::{SourceReader, SourceStream};

pub(crate) struct UploadSource {
    address: String,
    server: Option<Server>,
}

impl UploadSource {
    pub fn new(job: &JobDescriptor) -> Self {
        UploadSource {
            address: job.upload_address.clone(),
            server: None,
        }
    }

    /// Start listening before `open` is called. Used to know the port
    /// when the address is `:0`.
    pub fn listen(&mut self) -> Result<u16, ImportError> {
        let server = Server::http(&self.address).map_err(|e| {
            ImportError::SourceUnavailable(format!("listen on {}: {e}", self.address))
        })?;

        let port = server
            .server_addr()
            .to_ip()
            .map(|a| a.port())
            .unwrap_or_default();

        self.server = Some(server);
        Ok(port)
    }
}

impl SourceReader for UploadSource {
    fn open(&mut self, ctx: &Context) -> Result<SourceStream, ImportError> {
        let _enter = ctx.span.enter();

        if self.server.is_none() {
            self.listen()?;
        }

        let server = self
            .server
            .as_ref()
            .ok_or_else(|| ImportError::SourceUnavailable("upload channel closed".into()))?;

        tracing::info!(address = %self.address, "Waiting for upload.");

        loop {
            let request = server.recv().map_err(|e| {
                ImportError::SourceUnavailable(format!("upload channel {}: {e}", self.address))
            })?;

            if !matches!(request.method(), Method::Put | Method::Post) {
                let _ = request.respond(Response::empty(405));
                continue;
            }

            let length = request.body_length().map(|n| n as u64);
            tracing::info!(url = request.url(), length, "Upload started.");

            return Ok(SourceStream {
                reader: Box::new(UploadBody {
                    request: Some(request),
                }),
                length,
            });
        }
    }

    fn close(&mut self) {
        self.server = None;
    }
}

/// Body of an upload request.
///
/// The uploader receives a `200` response once the body is fully read.
struct UploadBody {
    request: Option<Request>,
}

impl Read for UploadBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(request) = self.request.as_mut() else {
            return Ok(0);
        };

        let n = request.as_reader().read(buf)?;

        if n == 0 && !buf.is_empty() {
            if let Some(request) = self.request.take() {
                request.respond(Response::empty(200))?;
            }
        }

        Ok(n)
    }
}

#[test]
fn receive_single_upload() {
    let mut job = crate::JobDescriptor::default();
    job.upload_address = "127.0.0.1:0".into();

    let mut source = UploadSource::new(&job);
    let port = source.listen().unwrap();

    let uploader = std::thread::spawn(move || {
        let url = format!("http://127.0.0.1:{port}/upload");

        // Only PUT/POST requests are accepted.
        let rejected = match ureq::get(&url).call() {
            Err(ureq::Error::Status(status, _)) => status,
            other => panic!("unexpected response: {other:?}"),
        };

        let accepted = ureq::put(&url).send_bytes(b"disk data").unwrap().status();
        (rejected, accepted)
    });

    let mut stream = source.open(&Context::new(crate::Progress::new())).unwrap();
    assert_eq!(stream.length, Some(9));

    let mut body = Vec::new();
    stream.reader.read_to_end(&mut body).unwrap();
    assert_eq!(body, b"disk data");

    assert_eq!(uploader.join().unwrap(), (405, 200));
}
