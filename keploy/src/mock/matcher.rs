use std::collections::BTreeSet;

use tracing::debug;

use super::flatten::flatten_body;
use crate::models::{HttpReq, Mock};
use crate::runtime::conf::NoiseParams;

/// Select the best-fitting mock for an observed outgoing request.
///
/// Candidates are narrowed in priority order; a step that eliminates every
/// candidate means no match:
///
/// 1. method + url path, exact
/// 2. recorded query parameters are a subset of the incoming ones
/// 3. recorded headers are a subset of the incoming ones (case-insensitive
///    keys, value-set subset), noise headers ignored
/// 4. body equality: flattened JSON maps when both sides parse, byte
///    equality otherwise, noise body paths ignored
/// 5. earliest recorded request timestamp among the remaining ties
pub fn find_best_match<'a>(
    req: &HttpReq,
    candidates: &[&'a Mock],
    noise: &NoiseParams,
) -> Option<&'a Mock> {
    let mut survivors: Vec<&Mock> = candidates
        .iter()
        .copied()
        .filter(|m| m.spec.req.method == req.method && m.spec.req.path() == req.path())
        .collect();
    if survivors.is_empty() {
        return None;
    }

    survivors.retain(|m| {
        m.spec
            .req
            .url_params
            .iter()
            .all(|(k, v)| req.url_params.get(k) == Some(v))
    });
    if survivors.is_empty() {
        debug!(
            event.name = "matcher.no_query_match",
            url = %req.url,
            "all candidates eliminated on query parameters"
        );
        return None;
    }

    survivors.retain(|m| headers_subset(m, req, noise));
    if survivors.is_empty() {
        debug!(
            event.name = "matcher.no_header_match",
            url = %req.url,
            "all candidates eliminated on headers"
        );
        return None;
    }

    survivors.retain(|m| bodies_match(&m.spec.req.body, &req.body, noise));
    if survivors.is_empty() {
        debug!(
            event.name = "matcher.no_body_match",
            url = %req.url,
            "all candidates eliminated on body"
        );
        return None;
    }

    survivors
        .into_iter()
        .min_by_key(|m| m.spec.req_timestamp_mock)
}

fn headers_subset(mock: &Mock, req: &HttpReq, noise: &NoiseParams) -> bool {
    mock.spec.req.header.iter().all(|(name, values)| {
        if is_noise_header(noise, name) {
            return true;
        }
        let Some(incoming) = req
            .header
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
        else {
            return false;
        };
        let incoming: BTreeSet<&String> = incoming.iter().collect();
        values.iter().all(|v| incoming.contains(v))
    })
}

fn is_noise_header(noise: &NoiseParams, name: &str) -> bool {
    noise.keys().any(|k| {
        k.eq_ignore_ascii_case("header")
            || k.strip_prefix("header.")
                .is_some_and(|h| h.eq_ignore_ascii_case(name))
    })
}

fn bodies_match(recorded: &[u8], incoming: &[u8], noise: &NoiseParams) -> bool {
    if noise.keys().any(|k| k == "body") {
        return true;
    }
    match (flatten_body(recorded), flatten_body(incoming)) {
        (Some(mut a), Some(mut b)) => {
            for key in noise.keys().filter(|k| k.starts_with("body.")) {
                a.remove(key);
                b.remove(key);
            }
            a == b
        }
        _ => recorded == incoming,
    }
}
