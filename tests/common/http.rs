use std::{
    io::Cursor,
    sync::mpsc::{self, Receiver},
    time::Duration,
};

use tiny_http::{Header, Response, Server, StatusCode};

/// Request received by a [`serve`] server.
#[derive(Debug)]
pub struct Received {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl Received {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Start an HTTP server in a random port to serve `body` in `path`.
///
/// If `chunked` is `true`, the response has no `Content-Length`.
///
/// Any other path gets a `404`. Every request is sent to the returned
/// channel.
pub fn serve(path: &'static str, body: Vec<u8>, chunked: bool) -> (u16, Receiver<Received>) {
    let server = Server::http("127.0.0.1:0").expect("start HTTP server");
    let port = server.server_addr().to_ip().unwrap().port();

    let (sender, receiver) = mpsc::channel();

    std::thread::spawn(move || {
        let timeout = Duration::from_secs(30);

        while let Ok(Some(request)) = server.recv_timeout(timeout) {
            let received = Received {
                url: request.url().to_owned(),
                headers: request
                    .headers()
                    .iter()
                    .map(|h| (h.field.to_string(), h.value.to_string()))
                    .collect(),
            };

            let found = received.url == path;
            let _ = sender.send(received);

            if !found {
                let _ = request.respond(Response::empty(404));
                continue;
            }

            let length = (!chunked).then_some(body.len());
            let response = Response::new(
                StatusCode(200),
                vec![Header::from_bytes("Content-Type", "application/octet-stream").unwrap()],
                Cursor::new(body.clone()),
                length,
                None,
            );

            let _ = request.respond(response);
        }
    });

    (port, receiver)
}
