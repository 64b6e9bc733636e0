//! `fetch` over a blocking HTTP client
//!
//! Each request runs on its own thread; answers land on a [`FetchQueue`]
//! that the worker's event loop polls, settling the script's promise on the
//! script thread. Responses are read whole (up to [`MAX_BODY_BYTES`]) and
//! handed to a small `Response` object built in JS. Jobs without network
//! access get a `fetch` that always rejects with `PermissionDenied`.

use rquickjs::{Ctx, Exception, Function, Persistent, Promise, Value};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::io::Read;
use std::rc::Rc;
use std::sync::mpsc;
use std::time::Duration;
use tracing::debug;

use crate::capability::{Capability, CapabilityMetadata};
use crate::errors::permission_denied;
use crate::util;

/// Largest response body a script can receive
pub const MAX_BODY_BYTES: u64 = 8 * 1024 * 1024;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const FETCH_SOURCE: &str = r#"
(function (start) {
  'use strict';
  function headerBag(entries) {
    const map = new Map(Object.entries(entries).map(([key, value]) => [key.toLowerCase(), value]));
    const key = (name) => String(name).toLowerCase();
    return Object.freeze({
      get: (name) => (map.has(key(name)) ? map.get(key(name)) : null),
      has: (name) => map.has(key(name)),
      forEach: (callback) => map.forEach((value, name) => callback(value, name)),
      entries: () => map.entries(),
    });
  }

  function requestHeaders(headers) {
    const out = {};
    if (!headers) return out;
    if (typeof headers.forEach === 'function' && !Array.isArray(headers)) {
      headers.forEach((value, name) => { out[name] = String(value); });
      return out;
    }
    const pairs = Array.isArray(headers) ? headers : Object.entries(headers);
    for (const [name, value] of pairs) out[name] = String(value);
    return out;
  }

  return async function fetch(resource, init) {
    init = init || {};
    const url = typeof resource === 'object' && resource !== null && 'url' in resource
      ? String(resource.url)
      : String(resource);
    const options = JSON.stringify({
      url,
      method: String(init.method || 'GET').toUpperCase(),
      headers: requestHeaders(init.headers),
      body: init.body === undefined || init.body === null ? null : String(init.body),
    });

    const data = JSON.parse(await start(options).then(undefined, (message) => {
      throw new TypeError('fetch failed: ' + message);
    }));

    let used = false;
    const consume = () => {
      if (used) throw new TypeError('Body has already been consumed');
      used = true;
      return data.body;
    };
    return Object.freeze({
      status: data.status,
      statusText: data.statusText,
      ok: data.status >= 200 && data.status < 300,
      url: data.url,
      headers: headerBag(data.headers),
      text: async () => consume(),
      json: async () => JSON.parse(consume()),
    });
  };
})
"#;

/// What the script asked for
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

/// What the script gets back
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchResponse {
    pub status: u16,
    #[serde(rename = "statusText")]
    pub status_text: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

type Outcome = Result<FetchResponse, String>;

struct InFlight {
    resolve: Persistent<Function<'static>>,
    reject: Persistent<Function<'static>>,
}

struct FetchState {
    next_id: u32,
    in_flight: BTreeMap<u32, InFlight>,
    ready: VecDeque<(u32, Outcome)>,
    client: Option<reqwest::blocking::Client>,
    sender: mpsc::Sender<(u32, Outcome)>,
    receiver: mpsc::Receiver<(u32, Outcome)>,
}

/// A request whose answer arrived, ready to settle its promise
pub struct CompletedFetch {
    pub id: u32,
    callbacks: InFlight,
    outcome: Outcome,
}

impl CompletedFetch {
    /// Resolves or rejects the script's promise
    pub fn settle<'js>(self, ctx: &Ctx<'js>) -> rquickjs::Result<()> {
        match self.outcome {
            Ok(response) => {
                let resolve = self.callbacks.resolve.restore(ctx)?;
                let json = serde_json::to_string(&response)
                    .map_err(|e| Exception::throw_message(ctx, &e.to_string()))?;
                resolve.call::<_, Value>((json,))?;
            }
            Err(message) => {
                let reject = self.callbacks.reject.restore(ctx)?;
                reject.call::<_, Value>((message,))?;
            }
        }
        Ok(())
    }
}

/// Requests of one job that have not been settled yet
#[derive(Clone)]
pub struct FetchQueue {
    state: Rc<RefCell<FetchState>>,
}

impl FetchQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            state: Rc::new(RefCell::new(FetchState {
                next_id: 0,
                in_flight: BTreeMap::new(),
                ready: VecDeque::new(),
                client: None,
                sender,
                receiver,
            })),
        }
    }

    /// Requests started and not yet settled
    pub fn in_flight(&self) -> usize {
        self.state.borrow().in_flight.len()
    }

    pub fn is_idle(&self) -> bool {
        self.state.borrow().in_flight.is_empty()
    }

    fn client(&self) -> Result<reqwest::blocking::Client, String> {
        let mut state = self.state.borrow_mut();
        if let Some(client) = &state.client {
            return Ok(client.clone());
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| e.to_string())?;
        state.client = Some(client.clone());
        Ok(client)
    }

    /// Sends the request from a new thread
    fn dispatch(&self, request: FetchRequest, callbacks: InFlight) -> Result<u32, String> {
        let client = self.client()?;
        let (id, sender) = {
            let mut state = self.state.borrow_mut();
            state.next_id += 1;
            (state.next_id, state.sender.clone())
        };

        debug!("fetch {}: {} {}", id, request.method, request.url);
        std::thread::Builder::new()
            .name(format!("fetch-{}", id))
            .spawn(move || {
                let outcome = perform(&client, request);
                let _ = sender.send((id, outcome));
            })
            .map_err(|e| format!("failed to start request: {}", e))?;

        self.state.borrow_mut().in_flight.insert(id, callbacks);
        Ok(id)
    }

    /// Takes one request whose answer has arrived
    pub fn take_completed(&self) -> Option<CompletedFetch> {
        let mut state = self.state.borrow_mut();
        loop {
            let (id, outcome) = match state.ready.pop_front() {
                Some(done) => done,
                None => state.receiver.try_recv().ok()?,
            };
            // Answers to requests abandoned by `clear` are dropped
            if let Some(callbacks) = state.in_flight.remove(&id) {
                return Some(CompletedFetch {
                    id,
                    callbacks,
                    outcome,
                });
            }
        }
    }

    /// Sleeps for up to `timeout`, waking early when an answer arrives
    pub fn wait(&self, timeout: Duration) {
        if self.is_idle() {
            std::thread::sleep(timeout);
            return;
        }
        let mut state = self.state.borrow_mut();
        if let Ok(done) = state.receiver.recv_timeout(timeout) {
            state.ready.push_back(done);
        }
    }

    /// Abandons every request
    ///
    /// Must run before the runtime is dropped. Threads still running finish
    /// on their own and their answers are ignored.
    pub fn clear(&self) {
        let mut state = self.state.borrow_mut();
        state.in_flight.clear();
        state.ready.clear();
    }
}

impl Default for FetchQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn perform(client: &reqwest::blocking::Client, request: FetchRequest) -> Outcome {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
        .map_err(|_| format!("invalid method {}", request.method))?;
    let mut builder = client.request(method, &request.url);
    for (name, value) in &request.headers {
        builder = builder.header(name, value);
    }
    if let Some(body) = request.body {
        builder = builder.body(body);
    }

    let response = builder.send().map_err(|e| e.to_string())?;
    let status = response.status();
    let url = response.url().to_string();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.to_string(), v.to_string())))
        .collect();

    let mut body = Vec::new();
    response
        .take(MAX_BODY_BYTES + 1)
        .read_to_end(&mut body)
        .map_err(|e| format!("failed to read response body: {}", e))?;
    if body.len() as u64 > MAX_BODY_BYTES {
        return Err(format!("response body exceeds {} bytes", MAX_BODY_BYTES));
    }

    Ok(FetchResponse {
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or_default().to_string(),
        url,
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

/// Parses the options built by the JS wrapper, accepting http(s) URLs only
fn parse_request(options: &str) -> Result<FetchRequest, String> {
    let request: FetchRequest =
        serde_json::from_str(options).map_err(|e| format!("invalid fetch options: {}", e))?;
    let url = reqwest::Url::parse(&request.url).map_err(|e| format!("invalid URL {}: {}", request.url, e))?;
    match url.scheme() {
        "http" | "https" => Ok(request),
        scheme => Err(format!("unsupported URL scheme \"{}\"", scheme)),
    }
}

pub struct FetchCapability {
    queue: FetchQueue,
    allow_network: bool,
}

impl FetchCapability {
    pub fn new(queue: FetchQueue, allow_network: bool) -> Self {
        Self { queue, allow_network }
    }

    fn start<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<Function<'js>> {
        let queue = self.queue.clone();
        let allow_network = self.allow_network;
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, options: String| {
            if !allow_network {
                return Err(permission_denied(&ctx, "network access is not allowed in the sandbox"));
            }
            let request = parse_request(&options).map_err(|e| Exception::throw_type(&ctx, &e))?;

            let (promise, resolve, reject) = ctx.promise()?;
            let callbacks = InFlight {
                resolve: Persistent::save(&ctx, resolve),
                reject: Persistent::save(&ctx, reject),
            };
            queue
                .dispatch(request, callbacks)
                .map_err(|e| Exception::throw_message(&ctx, &e))?;
            Ok::<Promise<'js>, rquickjs::Error>(promise)
        })
    }
}

impl Capability for FetchCapability {
    fn id(&self) -> &'static str {
        "fetch"
    }

    fn install<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<()> {
        let factory: Function = ctx.eval(FETCH_SOURCE)?;
        let fetch: Function = factory.call((self.start(ctx)?,))?;
        util::freeze(ctx, &fetch)?;
        util::define_locked(&ctx.globals(), "fetch", fetch)
    }

    fn declarations(&self) -> String {
        r#"interface SandboxResponse {
  readonly status: number;
  readonly statusText: string;
  readonly ok: boolean;
  readonly url: string;
  readonly headers: { get(name: string): string | null; has(name: string): boolean };
  text(): Promise<string>;
  json(): Promise<any>;
}
/** Rejects with PermissionDenied unless the job was given network access */
declare function fetch(
  url: string | { url: string },
  init?: { method?: string; headers?: Record<string, string>; body?: string },
): Promise<SandboxResponse>;
"#
        .to_string()
    }

    fn metadata(&self) -> CapabilityMetadata {
        CapabilityMetadata {
            id: self.id(),
            version: "1.0.0",
            description: "HTTP requests, when the job is allowed network access",
        }
    }
}
