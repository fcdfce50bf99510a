//! HTTP control plane (SPEC_FULL.md §4.1, §6, §8.2).
//!
//! A blocking accept loop built on `tiny_http`, the donor's own test-mock
//! HTTP stack (`shipper/src/engine.rs::spawn_counter_server`,
//! `shipper/src/registry.rs`) promoted to a production dependency per
//! SPEC_FULL.md §8.2: one more `std::thread` in the same
//! thread-per-worker concurrency model the scheduler already uses, rather
//! than introducing an async runtime.
//!
//! Three endpoints, all unauthenticated (Non-goals: "does not
//! authenticate clients"):
//!
//! - `GET /` and `GET /build_instructions/` — snapshot of all instructions.
//! - `GET /deliverables/` — deliverables map of active instructions.
//! - `POST /` — submit an array of instruction descriptors.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tiny_http::{Method, Response, Server, StatusCode};

use crate::reporter::Reporter;
use crate::scheduler::Scheduler;

/// How long `recv_timeout` blocks before the accept loop rechecks the
/// scheduler's shutdown flag, mirroring the worker loop's own poll
/// interval (§4.2).
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A malformed POST body is rejected without being echoed back (§4.1
/// error policy: "malformed bodies → 400 without echoing content").
const MALFORMED_JSON_BODY: &str = "malformed JSON";

/// Run the control plane's accept loop on the calling thread until the
/// scheduler observes a shutdown request. Each request is handled
/// synchronously on this same thread (no per-request thread spawn) since
/// request handling here is cheap map/vec work, never a blocking external
/// process call.
pub fn serve(server: &Server, scheduler: &Scheduler, reporter: &dyn Reporter) {
    loop {
        match server.recv_timeout(ACCEPT_POLL_INTERVAL) {
            Ok(Some(request)) => handle_request(request, scheduler, reporter),
            Ok(None) => {}
            Err(e) => reporter.warn(&format!("control plane accept error: {e}")),
        }

        if scheduler.is_shutting_down() {
            reporter.info("control plane accept loop shutting down");
            return;
        }
    }
}

fn handle_request(mut request: tiny_http::Request, scheduler: &Scheduler, reporter: &dyn Reporter) {
    let method = request.method().clone();
    let url = request.url().to_string();

    let response = match (&method, url.as_str()) {
        (Method::Get, "/") | (Method::Get, "/build_instructions/") => {
            json_response(&scheduler.snapshot_all())
        }
        (Method::Get, "/deliverables/") => json_response(&scheduler.snapshot_active_deliverables()),
        (Method::Post, "/") => handle_submit(&mut request, scheduler, reporter),
        _ => Response::from_string("not found").with_status_code(StatusCode(404)).boxed(),
    };

    if let Err(e) = request.respond(response) {
        reporter.warn(&format!("failed to write HTTP response: {e}"));
    }
}

fn json_response<T: serde::Serialize>(value: &T) -> tiny_http::ResponseBox {
    match serde_json::to_string(value) {
        Ok(body) => Response::from_string(body)
            .with_status_code(StatusCode(200))
            .with_header(content_type_json())
            .boxed(),
        Err(_) => Response::from_string("internal error").with_status_code(StatusCode(500)).boxed(),
    }
}

fn content_type_json() -> tiny_http::Header {
    tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
        .expect("static header is valid ASCII")
}

/// Handle `POST /` (§4.1, §6): the body must parse as a JSON array; each
/// element is attempted independently, so one malformed descriptor among
/// several well-formed ones doesn't reject the whole submission.
fn handle_submit(request: &mut tiny_http::Request, scheduler: &Scheduler, reporter: &dyn Reporter) -> tiny_http::ResponseBox {
    let mut body = String::new();
    if let Err(e) = request.as_reader().read_to_string(&mut body) {
        reporter.warn(&format!("failed to read POST body: {e}"));
        return Response::from_string(MALFORMED_JSON_BODY).with_status_code(StatusCode(400)).boxed();
    }

    let descriptors: Vec<Value> = match serde_json::from_str(&body) {
        Ok(Value::Array(items)) => items,
        _ => {
            reporter.warn("rejecting malformed instruction submission body");
            return Response::from_string(MALFORMED_JSON_BODY).with_status_code(StatusCode(400)).boxed();
        }
    };

    for descriptor in descriptors {
        match serde_json::from_value::<docbuild_types::SubmittedInstruction>(descriptor.clone()) {
            Ok(submitted) => {
                let outcome = scheduler.submit(&submitted, reporter);
                reporter.info(&format!(
                    "submitted {}/{}/{}/{}: {outcome:?}",
                    submitted.target, submitted.product, submitted.docset, submitted.lang
                ));
            }
            Err(e) => {
                reporter.warn(&format!(
                    "skipping instruction descriptor with missing or non-string field: {e} ({descriptor})"
                ));
            }
        }
    }

    Response::from_string("ok").with_status_code(StatusCode(200)).boxed()
}
