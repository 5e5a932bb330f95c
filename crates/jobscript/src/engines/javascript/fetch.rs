//! The `fetch` builtin for the JavaScript engine
//!
//! The host side exposes one native function, `__fetchNative(url, optsJson)`,
//! which performs a blocking HTTP request through the shared client and
//! returns the response as JSON. The JavaScript prelude wraps it into a
//! web-style `fetch(resource, opts?) -> Promise` with header accessors and a
//! single-consumption body.
//!
//! Timeouts are per call, in milliseconds, defaulting to the engine's
//! configured value. Response bodies are transported as text; binary
//! payloads are lossy.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use boa_engine::property::Attribute;
use boa_engine::{
    js_string, Context, JsError, JsNativeError, JsResult, JsString, JsValue, NativeFunction,
    Source,
};
use serde::{Deserialize, Serialize};

/// Options decoded from the prelude's normalized JSON.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct FetchOptions {
    method: String,
    headers: HashMap<String, String>,
    body: Option<serde_json::Value>,
    /// Milliseconds.
    timeout: u64,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            headers: HashMap::new(),
            body: None,
            timeout: 0,
        }
    }
}

/// Response shape handed back to the prelude.
#[derive(Debug, Serialize)]
struct FetchResponse {
    status: u16,
    status_text: String,
    headers: HashMap<String, Vec<String>>,
    url: String,
    body: String,
}

/// JavaScript half of the builtin: normalizes arguments, calls the native
/// function, and builds a web-ish Response object with a single-consumption
/// body.
const FETCH_PRELUDE: &str = r#"
function __makeResponse(raw) {
    const headerMap = raw.headers || {};
    const findKey = function (name) {
        const lower = String(name).toLowerCase();
        for (const key in headerMap) {
            if (key.toLowerCase() === lower) { return key; }
        }
        return null;
    };
    const response = {
        status: raw.status,
        statusText: raw.status_text,
        ok: raw.status >= 200 && raw.status < 300,
        url: raw.url,
        __body: raw.body,
        __bodyUsed: false,
        headers: {
            get: function (name) {
                const key = findKey(name);
                return key === null ? null : headerMap[key][0];
            },
            getAll: function (name) {
                const key = findKey(name);
                return key === null ? [] : headerMap[key].slice();
            },
            has: function (name) { return findKey(name) !== null; },
            forEach: function (callback, thisArg) {
                if (typeof callback !== "function") {
                    throw new TypeError("Headers.forEach callback must be a function");
                }
                for (const key in headerMap) {
                    const values = headerMap[key];
                    for (let i = 0; i < values.length; i++) {
                        callback.call(thisArg, values[i], key, response.headers);
                    }
                }
            },
        },
        __takeBody: function () {
            if (response.__bodyUsed) {
                throw new TypeError("body has already been consumed");
            }
            response.__bodyUsed = true;
            return response.__body;
        },
        text: function () {
            return new Promise(function (resolve, reject) {
                try { resolve(response.__takeBody()); } catch (e) { reject(e); }
            });
        },
        json: function () {
            return new Promise(function (resolve, reject) {
                try { resolve(JSON.parse(response.__takeBody())); } catch (e) { reject(e); }
            });
        },
        arrayBuffer: function () {
            return new Promise(function (resolve, reject) {
                try {
                    const text = response.__takeBody();
                    const bytes = new Uint8Array(text.length);
                    for (let i = 0; i < text.length; i++) {
                        bytes[i] = text.charCodeAt(i) & 0xff;
                    }
                    resolve(bytes.buffer);
                } catch (e) { reject(e); }
            });
        },
    };
    return response;
}

function fetch(resource, opts) {
    return new Promise(function (resolve, reject) {
        try {
            let url;
            const options = { method: "GET", headers: {}, timeout: __FETCH_TIMEOUT_MS };

            if (typeof resource === "string") {
                url = resource;
            } else if (resource && typeof resource === "object") {
                if (typeof resource.url !== "string") {
                    throw new TypeError("fetch: object must have a 'url' property");
                }
                url = resource.url;
                if (resource.method) { options.method = String(resource.method); }
                if (resource.headers) {
                    for (const key in resource.headers) {
                        options.headers[key] = String(resource.headers[key]);
                    }
                }
                if (resource.body !== undefined) { options.body = resource.body; }
                if (typeof resource.timeout === "number") { options.timeout = resource.timeout; }
            } else {
                throw new TypeError(
                    "fetch: first argument must be a string URL or an object with at least a 'url' property");
            }

            if (opts && typeof opts === "object") {
                if (opts.method) { options.method = String(opts.method); }
                if (opts.headers) {
                    for (const key in opts.headers) {
                        options.headers[key] = String(opts.headers[key]);
                    }
                }
                if (opts.body !== undefined) { options.body = opts.body; }
                if (typeof opts.timeout === "number") { options.timeout = opts.timeout; }
            }

            const raw = __fetchNative(url, JSON.stringify(options));
            resolve(__makeResponse(JSON.parse(raw)));
        } catch (e) {
            reject(e);
        }
    });
}
"#;

/// Install the native half and the prelude into a context.
pub fn install(context: &mut Context, default_timeout: Duration) -> Result<(), String> {
    context
        .register_global_builtin_callable(
            js_string!("__fetchNative"),
            2,
            NativeFunction::from_fn_ptr(fetch_native),
        )
        .map_err(|e| format!("__fetchNative: {e}"))?;

    context
        .register_global_property(
            js_string!("__FETCH_TIMEOUT_MS"),
            JsValue::from(default_timeout.as_millis() as f64),
            Attribute::all(),
        )
        .map_err(|e| format!("__FETCH_TIMEOUT_MS: {e}"))?;

    context
        .eval(Source::from_bytes(FETCH_PRELUDE.as_bytes()))
        .map_err(|e| format!("prelude: {e}"))?;

    Ok(())
}

fn fetch_native(_this: &JsValue, args: &[JsValue], _context: &mut Context) -> JsResult<JsValue> {
    let url = args
        .first()
        .and_then(JsValue::as_string)
        .map(|s| s.to_std_string_escaped())
        .ok_or_else(|| type_error("fetch requires at least one argument"))?;

    let options: FetchOptions = match args.get(1).and_then(JsValue::as_string) {
        Some(raw) => serde_json::from_str(&raw.to_std_string_escaped())
            .map_err(|e| type_error(&format!("FETCH_REQUEST_ERROR: invalid options: {e}")))?,
        None => FetchOptions::default(),
    };

    let response = execute_fetch(&url, options).map_err(JsError::from)?;
    let payload = serde_json::to_string(&response)
        .map_err(|e| type_error(&format!("FETCH_MARSHAL_ERROR: {e}")))?;

    Ok(JsValue::from(JsString::from(payload)))
}

fn type_error(message: &str) -> JsError {
    JsNativeError::typ().with_message(message.to_string()).into()
}

fn error(message: String) -> JsNativeError {
    JsNativeError::error().with_message(message)
}

/// Perform the blocking HTTP request. Runs on the VM's blocking thread.
fn execute_fetch(url: &str, options: FetchOptions) -> Result<FetchResponse, JsNativeError> {
    static CLIENT: OnceLock<reqwest::blocking::Client> = OnceLock::new();
    let client = CLIENT.get_or_init(|| {
        reqwest::blocking::Client::builder()
            .build()
            .expect("fetch client")
    });

    let timeout = if options.timeout > 0 {
        Duration::from_millis(options.timeout)
    } else {
        Duration::from_millis(30_000)
    };

    let method = reqwest::Method::from_bytes(options.method.as_bytes())
        .map_err(|e| error(format!("FETCH_REQUEST_ERROR: invalid method: {e}")))?;

    let mut request = client.request(method, url).timeout(timeout);

    let mut has_content_type = false;
    for (key, value) in &options.headers {
        if key.eq_ignore_ascii_case("content-type") {
            has_content_type = true;
        }
        request = request.header(key, value);
    }

    if let Some(body) = options.body {
        match body {
            serde_json::Value::String(text) => {
                request = request.body(text);
            }
            other => {
                let encoded = serde_json::to_string(&other)
                    .map_err(|e| error(format!("FETCH_MARSHAL_ERROR: {e}")))?;
                if !has_content_type {
                    request = request.header("Content-Type", "application/json");
                }
                request = request.body(encoded);
            }
        }
    }

    let response = request
        .send()
        .map_err(|e| error(format!("FETCH_EXECUTION_ERROR: request failed: {e}")))?;

    let status = response.status();
    let final_url = response.url().to_string();
    let mut headers: HashMap<String, Vec<String>> = HashMap::new();
    for (key, value) in response.headers() {
        if let Ok(text) = value.to_str() {
            headers
                .entry(key.to_string())
                .or_default()
                .push(text.to_string());
        }
    }

    let body = response
        .text()
        .map_err(|e| error(format!("FETCH_READ_BODY_ERROR: failed to read response body: {e}")))?;

    Ok(FetchResponse {
        status: status.as_u16(),
        status_text: status
            .canonical_reason()
            .unwrap_or_else(|| status.as_str())
            .to_string(),
        headers,
        url: final_url,
        body,
    })
}
