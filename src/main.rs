//! bridge-echo: example backend for the HTTP bridge.
//!
//! Connects to a front-end, logs every request, and answers with the
//! request body echoed back. `GET /ping` gets an empty 200.
//! Reconnects when the front-end goes away.

mod config;

use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use bridge_backend::{
    Backend, Buffer, InFrame, Request, Response, SendResult, StatusCode, StreamKey,
};
use config::Config;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

const ECHO_PREFIX: &[u8] = b"You said: ";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        address = %config.address,
        max_auto_buffer_size = config.backend.max_auto_buffer_size,
        max_waiting_buffer_total = config.backend.max_waiting_buffer_total,
        buffer_all = config.buffer_all,
        "Starting bridge-echo"
    );

    let mut backend = Backend::new(config.backend.clone());
    // bodies of streamed requests, accumulated here
    let mut streams: HashMap<StreamKey, Buffer> = HashMap::new();

    loop {
        if !backend.is_connected() {
            streams.clear();
            if let Err(e) = backend.connect_tcp(&config.address) {
                warn!(address = %config.address, error = %e, "Connect failed, retrying");
                thread::sleep(RECONNECT_DELAY);
                continue;
            }
        }

        match backend.recv() {
            Ok(Some(frame)) => handle_frame(&frame, &mut streams, config.buffer_all),
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Connection lost");
                thread::sleep(RECONNECT_DELAY);
            }
        }
    }
}

fn handle_frame(frame: &InFrame<'_>, streams: &mut HashMap<StreamKey, Buffer>, buffer_all: bool) {
    let request = frame.request();
    let key = request.key();

    if frame.is_aborted() {
        info!(stream = %key, "Request aborted");
        streams.remove(&key);
        return;
    }

    if frame.is_header() {
        info!(
            stream = %key,
            version = %request.version(),
            method = %String::from_utf8_lossy(request.method()),
            uri = %String::from_utf8_lossy(request.uri()),
            body_length = request.body_length(),
            "Request"
        );
        for (name, value) in request.headers() {
            debug!(
                stream = %key,
                "{}: {}",
                String::from_utf8_lossy(name),
                String::from_utf8_lossy(value)
            );
        }

        if frame.is_last() {
            respond(request, frame.body());
            return;
        }
        if buffer_all {
            frame.resend_when_body_is_done();
            return;
        }
    }

    streams.entry(key).or_default().extend(frame.body());
    if frame.is_last() {
        let body = streams
            .remove(&key)
            .map(|buffer| buffer.freeze().0)
            .unwrap_or_default();
        respond(request, &body);
    }
}

fn respond(request: &std::sync::Arc<Request>, body: &[u8]) {
    let response = if request.method() == b"GET" && request.uri() == b"/ping" {
        Response::new(request, StatusCode::OK)
    } else {
        let mut echo = Vec::with_capacity(ECHO_PREFIX.len() + body.len());
        echo.extend_from_slice(ECHO_PREFIX);
        echo.extend_from_slice(body);

        let mut response = Response::new(request, StatusCode::OK);
        response.write_header("Content-Type", "text/plain");
        response.set_body(echo);
        response
    };

    if response.send() == SendResult::Closed {
        debug!(stream = %request.key(), "Response not delivered");
    }
}
