//! Bounded-time WAF execution: value bridge, compiled ruleset handle,
//! per-request evaluation contexts and the request-lifecycle decision logic.

pub mod engine;
pub mod object;
pub mod processor;
pub mod ruleset;

pub use engine::{EvaluationContext, WafEngine, WafResult};
pub use object::WafObject;
pub use processor::{AppSecProcessor, RequestRecord};
pub use ruleset::RulesetInfo;

/// Named input addresses the ruleset vocabulary is built from.
pub mod addresses {
    pub const SERVER_REQUEST_BODY: &str = "server.request.body";
    pub const SERVER_REQUEST_QUERY: &str = "server.request.query";
    pub const SERVER_REQUEST_HEADERS_NO_COOKIES: &str = "server.request.headers.no_cookies";
    pub const SERVER_REQUEST_URI_RAW: &str = "server.request.uri.raw";
    pub const SERVER_REQUEST_METHOD: &str = "server.request.method";
    pub const SERVER_REQUEST_PATH_PARAMS: &str = "server.request.path_params";
    pub const SERVER_REQUEST_COOKIES: &str = "server.request.cookies";
    pub const HTTP_CLIENT_IP: &str = "http.client_ip";
    pub const SERVER_RESPONSE_STATUS: &str = "server.response.status";
    pub const SERVER_RESPONSE_HEADERS_NO_COOKIES: &str = "server.response.headers.no_cookies";
}
