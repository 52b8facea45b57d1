use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use glint_http1::{BodyMode, HeaderBlock, HttpVersion, RequestHead, ResponseHead};
use regex::Regex;

use crate::context::ExchangeContext;
use crate::strategy::ConnectDecision;

pub type RequestPredicate = Arc<dyn Fn(&RequestHead, &ExchangeContext) -> bool + Send + Sync>;
pub type ResponsePredicate = Arc<dyn Fn(&ResponseHead, &ExchangeContext) -> bool + Send + Sync>;

type RequestHandlerFn = Arc<
    dyn Fn(RequestHead, &mut ExchangeContext) -> (RequestHead, Option<FilterResponse>)
        + Send
        + Sync,
>;
type ResponseHandlerFn =
    Arc<dyn Fn(FilterResponse, &mut ExchangeContext) -> FilterResponse + Send + Sync>;
type ConnectHandlerFn =
    Arc<dyn Fn(&str, &mut ExchangeContext) -> Option<ConnectDecision> + Send + Sync>;

/// Response as seen by the filter chain. `Upstream` means the body is still
/// unread on the origin connection; a handler that swaps in `Replaced`
/// bytes forces chunked re-framing on output.
pub struct FilterResponse {
    pub head: ResponseHead,
    pub body: ResponseBody,
}

pub enum ResponseBody {
    Upstream,
    Replaced(Bytes),
}

impl FilterResponse {
    pub fn from_upstream(head: ResponseHead) -> Self {
        Self {
            head,
            body: ResponseBody::Upstream,
        }
    }

    /// A response fabricated by a request handler; short-circuits the
    /// upstream round trip.
    pub fn synthetic(status_code: u16, reason: &str, body: Bytes) -> Self {
        let mut headers = HeaderBlock::new();
        headers.set("Content-Length", body.len().to_string());
        let head = ResponseHead {
            version: HttpVersion::Http11,
            status_code,
            reason: reason.to_string(),
            headers,
            body_mode: if body.is_empty() {
                BodyMode::None
            } else {
                BodyMode::ContentLength(body.len() as u64)
            },
            connection_close: false,
        };
        Self {
            head,
            body: ResponseBody::Replaced(body),
        }
    }

    pub fn replace_body(&mut self, body: Bytes) {
        self.body = ResponseBody::Replaced(body);
    }

    pub fn is_replaced(&self) -> bool {
        matches!(self.body, ResponseBody::Replaced(_))
    }
}

struct GuardedRequestHandler {
    predicates: Vec<RequestPredicate>,
    handler: RequestHandlerFn,
}

struct GuardedResponseHandler {
    request_predicates: Vec<RequestPredicate>,
    response_predicates: Vec<ResponsePredicate>,
    handler: ResponseHandlerFn,
}

struct GuardedConnectHandler {
    predicates: Vec<RequestPredicate>,
    handler: ConnectHandlerFn,
}

/// Ordered request/response/CONNECT handler registries with predicate
/// guards. Registration order is execution order.
#[derive(Default)]
pub struct FilterChain {
    request_handlers: Vec<GuardedRequestHandler>,
    response_handlers: Vec<GuardedResponseHandler>,
    connect_handlers: Vec<GuardedConnectHandler>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_request(
        &mut self,
        predicates: Vec<RequestPredicate>,
        handler: impl Fn(RequestHead, &mut ExchangeContext) -> (RequestHead, Option<FilterResponse>)
            + Send
            + Sync
            + 'static,
    ) {
        self.request_handlers.push(GuardedRequestHandler {
            predicates,
            handler: Arc::new(handler),
        });
    }

    /// Response handlers may carry request predicates too; those run
    /// against the request snapshot captured on the context.
    pub fn on_response(
        &mut self,
        request_predicates: Vec<RequestPredicate>,
        response_predicates: Vec<ResponsePredicate>,
        handler: impl Fn(FilterResponse, &mut ExchangeContext) -> FilterResponse
            + Send
            + Sync
            + 'static,
    ) {
        self.response_handlers.push(GuardedResponseHandler {
            request_predicates,
            response_predicates,
            handler: Arc::new(handler),
        });
    }

    pub fn on_connect(
        &mut self,
        predicates: Vec<RequestPredicate>,
        handler: impl Fn(&str, &mut ExchangeContext) -> Option<ConnectDecision>
            + Send
            + Sync
            + 'static,
    ) {
        self.connect_handlers.push(GuardedConnectHandler {
            predicates,
            handler: Arc::new(handler),
        });
    }

    /// Runs request handlers in order. A handler returning a response
    /// short-circuits: remaining request handlers are skipped and the
    /// synthetic response goes straight into the response pass.
    pub fn run_request(
        &self,
        mut request: RequestHead,
        ctx: &mut ExchangeContext,
    ) -> (RequestHead, Option<FilterResponse>) {
        for guarded in &self.request_handlers {
            if !guarded.predicates.iter().all(|pred| pred(&request, ctx)) {
                continue;
            }
            let (next, synthetic) = (guarded.handler)(request, ctx);
            request = next;
            if synthetic.is_some() {
                return (request, synthetic);
            }
        }
        (request, None)
    }

    /// Each handler sees the previous handler's output.
    pub fn run_response(
        &self,
        mut response: FilterResponse,
        ctx: &mut ExchangeContext,
    ) -> FilterResponse {
        for guarded in &self.response_handlers {
            let request_ok = guarded.request_predicates.iter().all(|pred| {
                ctx.request
                    .as_ref()
                    .map(|request| pred(request, ctx))
                    .unwrap_or(false)
            });
            if !request_ok {
                continue;
            }
            if !guarded
                .response_predicates
                .iter()
                .all(|pred| pred(&response.head, ctx))
            {
                continue;
            }
            response = (guarded.handler)(response, ctx);
        }
        response
    }

    pub fn run_connect(&self, host: &str, ctx: &mut ExchangeContext) -> Option<ConnectDecision> {
        for guarded in &self.connect_handlers {
            let predicates_ok = guarded.predicates.iter().all(|pred| {
                ctx.request
                    .as_ref()
                    .map(|request| pred(request, ctx))
                    .unwrap_or(false)
            });
            if !predicates_ok {
                continue;
            }
            if let Some(decision) = (guarded.handler)(host, ctx) {
                return Some(decision);
            }
        }
        None
    }
}

/// Matches when the request path, or authority+path, is in the given set.
pub fn url_any(urls: &[&str]) -> RequestPredicate {
    let set: HashSet<String> = urls.iter().map(|url| url.to_string()).collect();
    Arc::new(move |request, _ctx| {
        if set.contains(request.path()) {
            return true;
        }
        match request.authority() {
            Some(authority) => set.contains(&format!("{authority}{}", request.path())),
            None => false,
        }
    })
}

/// Matches the full URL string against any of the patterns, falling back to
/// authority+path when the target alone is not absolute.
pub fn url_regex(patterns: &[&str]) -> Result<RequestPredicate, regex::Error> {
    let rules = patterns
        .iter()
        .map(|pattern| Regex::new(pattern))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Arc::new(move |request, _ctx| {
        let target = if request.is_absolute_target() {
            request.target.clone()
        } else {
            format!(
                "{}{}",
                request.host().unwrap_or_default(),
                request.path()
            )
        };
        rules.iter().any(|rule| rule.is_match(&target))
    }))
}

/// Matches an exact Content-Type or one carrying `;`-delimited parameters.
pub fn content_type_prefix(types: &[&str]) -> ResponsePredicate {
    let exact: Vec<String> = types.iter().map(|t| t.to_string()).collect();
    let prefixed: Vec<String> = types.iter().map(|t| format!("{t};")).collect();
    Arc::new(move |response, _ctx| {
        let Some(content_type) = response.headers.get("Content-Type") else {
            return false;
        };
        exact.iter().any(|t| content_type == t)
            || prefixed.iter().any(|p| content_type.starts_with(p.as_str()))
    })
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use glint_http1::{parse_request_head, parse_response_head};

    use super::{content_type_prefix, url_any, url_regex, FilterChain, FilterResponse};
    use crate::context::ExchangeContext;

    fn request(raw: &[u8]) -> glint_http1::RequestHead {
        parse_request_head(raw).expect("request parses")
    }

    fn response(raw: &[u8]) -> glint_http1::ResponseHead {
        parse_response_head(raw, "GET").expect("response parses")
    }

    #[test]
    fn request_short_circuit_skips_later_handlers() {
        let mut chain = FilterChain::new();
        chain.on_request(Vec::new(), |request, _ctx| {
            let synthetic = FilterResponse::synthetic(403, "Forbidden", Bytes::from_static(b"no"));
            (request, Some(synthetic))
        });
        chain.on_request(Vec::new(), |mut request, _ctx| {
            request.method = "MUTATED".to_string();
            (request, None)
        });

        let mut ctx = ExchangeContext::new(1, None);
        let (request, synthetic) = chain.run_request(
            request(b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n"),
            &mut ctx,
        );
        assert_eq!(request.method, "GET", "later handler must not run");
        let synthetic = synthetic.expect("short-circuit response");
        assert_eq!(synthetic.head.status_code, 403);
        assert!(synthetic.is_replaced());
    }

    #[test]
    fn request_predicates_gate_the_handler() {
        let mut chain = FilterChain::new();
        chain.on_request(vec![url_any(&["/admin"])], |mut request, _ctx| {
            request.headers.set("X-Flagged", "1");
            (request, None)
        });

        let mut ctx = ExchangeContext::new(1, None);
        let (hit, _) = chain.run_request(
            request(b"GET /admin HTTP/1.1\r\nHost: h\r\n\r\n"),
            &mut ctx,
        );
        assert_eq!(hit.headers.get("X-Flagged"), Some("1"));

        let (miss, _) = chain.run_request(
            request(b"GET /other HTTP/1.1\r\nHost: h\r\n\r\n"),
            &mut ctx,
        );
        assert!(miss.headers.get("X-Flagged").is_none());
    }

    #[test]
    fn response_handlers_compose_in_order() {
        let mut chain = FilterChain::new();
        chain.on_response(Vec::new(), Vec::new(), |mut response, _ctx| {
            response.head.headers.set("X-Order", "first");
            response
        });
        chain.on_response(Vec::new(), Vec::new(), |mut response, _ctx| {
            let prior = response.head.headers.get("X-Order").unwrap_or("").to_string();
            response.head.headers.set("X-Order", format!("{prior},second"));
            response
        });

        let mut ctx = ExchangeContext::new(1, None);
        ctx.request = Some(request(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n"));
        let out = chain.run_response(
            FilterResponse::from_upstream(response(
                b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
            )),
            &mut ctx,
        );
        assert_eq!(out.head.headers.get("X-Order"), Some("first,second"));
    }

    #[test]
    fn response_handler_request_predicates_check_the_captured_request() {
        let mut chain = FilterChain::new();
        chain.on_response(vec![url_any(&["/watch"])], Vec::new(), |mut response, _ctx| {
            response.head.headers.set("X-Watched", "1");
            response
        });

        let mut ctx = ExchangeContext::new(1, None);
        ctx.request = Some(request(b"GET /watch HTTP/1.1\r\nHost: h\r\n\r\n"));
        let hit = chain.run_response(
            FilterResponse::from_upstream(response(
                b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
            )),
            &mut ctx,
        );
        assert_eq!(hit.head.headers.get("X-Watched"), Some("1"));

        ctx.request = Some(request(b"GET /other HTTP/1.1\r\nHost: h\r\n\r\n"));
        let miss = chain.run_response(
            FilterResponse::from_upstream(response(
                b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
            )),
            &mut ctx,
        );
        assert!(miss.head.headers.get("X-Watched").is_none());
    }

    #[test]
    fn url_any_matches_path_and_authority_path() {
        let predicate = url_any(&["/x", "a.example/y"]);
        let ctx = ExchangeContext::new(1, None);
        assert!(predicate(
            &request(b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n"),
            &ctx
        ));
        assert!(predicate(
            &request(b"GET http://a.example/y HTTP/1.1\r\nHost: a.example\r\n\r\n"),
            &ctx
        ));
        assert!(!predicate(
            &request(b"GET /z HTTP/1.1\r\nHost: h\r\n\r\n"),
            &ctx
        ));
    }

    #[test]
    fn url_regex_falls_back_to_host_plus_path() {
        let predicate = url_regex(&[r"^a\.example/login$"]).expect("regex compiles");
        let ctx = ExchangeContext::new(1, None);
        assert!(predicate(
            &request(b"GET /login HTTP/1.1\r\nHost: a.example\r\n\r\n"),
            &ctx
        ));
        assert!(!predicate(
            &request(b"GET /login HTTP/1.1\r\nHost: b.example\r\n\r\n"),
            &ctx
        ));

        let absolute = url_regex(&[r"^https://a\.example/"]).expect("regex compiles");
        assert!(absolute(
            &request(b"GET https://a.example/q HTTP/1.1\r\nHost: a.example\r\n\r\n"),
            &ctx
        ));
    }

    #[test]
    fn content_type_prefix_allows_parameters() {
        let predicate = content_type_prefix(&["application/json"]);
        let ctx = ExchangeContext::new(1, None);
        assert!(predicate(
            &response(b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 0\r\n\r\n"),
            &ctx
        ));
        assert!(predicate(
            &response(b"HTTP/1.1 200 OK\r\nContent-Type: application/json; charset=utf-8\r\nContent-Length: 0\r\n\r\n"),
            &ctx
        ));
        assert!(!predicate(
            &response(b"HTTP/1.1 200 OK\r\nContent-Type: application/json-patch\r\nContent-Length: 0\r\n\r\n"),
            &ctx
        ));
        assert!(!predicate(
            &response(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n"),
            &ctx
        ));
    }
}
