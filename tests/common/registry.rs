use std::time::Duration;

use tiny_http::{Header, Request, Response, Server};

use super::blobs::{Blob, MANIFEST};

/// Start a registry server in a random port.
///
/// Returns the port number of the server.
pub fn start_registry(
    repository: &'static str,
    tag: &'static str,
    config: Blob,
    layers: Vec<Blob>,
) -> u16 {
    let server = Server::http("127.0.0.1:0").expect("start registry server");
    let port = server.server_addr().to_ip().unwrap().port();

    let registry = Registry::new(server, repository, tag, config, layers);

    std::thread::spawn(move || registry.run());

    port
}

struct Registry {
    server: Server,
    manifest_path: String,
    blobs_prefix: String,
    config: Blob,
    layers: Vec<Blob>,
}

impl Registry {
    fn new(
        server: Server,
        repository: &'static str,
        tag: &'static str,
        config: Blob,
        layers: Vec<Blob>,
    ) -> Registry {
        Registry {
            server,
            manifest_path: format!("/v2/{repository}/manifests/{tag}"),
            blobs_prefix: format!("/v2/{repository}/blobs/sha256:"),
            config,
            layers,
        }
    }

    fn run(self) {
        let timeout = Duration::from_secs(30);

        while let Ok(Some(request)) = self.server.recv_timeout(timeout) {
            self.handle(request);
        }
    }

    fn handle(&self, request: Request) {
        if request.method() != &tiny_http::Method::Get {
            let _ = request.respond(Response::empty(405));
            return;
        }

        let url = request.url().to_owned();

        // Manifest
        if url == self.manifest_path {
            self.manifest(request);
            return;
        }

        // Blobs
        if let Some(blob) = url
            .strip_prefix(&self.blobs_prefix)
            .and_then(|digest| self.find_blob(digest))
        {
            Self::send_body(request, blob.media_type, blob.data.clone());
            return;
        }

        let _ = request.respond(Response::empty(404));
    }

    fn manifest(&self, request: Request) {
        let image = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MANIFEST,
            "config": self.config.descriptor(),
            "layers": self.layers.iter().map(Blob::descriptor).collect::<Vec<_>>(),
        });

        Self::send_body(request, MANIFEST, image.to_string());
    }

    fn find_blob(&self, digest: &str) -> Option<&Blob> {
        if self.config.digest == digest {
            return Some(&self.config);
        }

        self.layers.iter().find(|l| l.digest == digest)
    }

    fn send_body(request: Request, media_type: &str, body: impl Into<Vec<u8>>) {
        let response = Response::from_data(body)
            .with_status_code(200)
            .with_header(Header::from_bytes("Content-Type", media_type).unwrap());

        request.respond(response).expect("Send response");
    }
}
