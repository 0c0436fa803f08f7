use crate::mock::flatten_body;
use crate::models::{BodyResult, HeaderResult, HttpResp, StatusCodeResult};
use crate::runtime::conf::NoiseParams;

/// Outcome of diffing a replayed response against its recording.
#[derive(Debug)]
pub struct DiffOutcome {
    pub passed: bool,
    pub status_code: StatusCodeResult,
    pub headers: Vec<HeaderResult>,
    pub body: BodyResult,
}

/// Compare a replayed response with the recorded one, ignoring noise fields.
///
/// Noise keys use `header.<Name>` (case-insensitive) and `body.<dotted.path>`
/// forms; a bare `header` or `body` key masks that whole section.
/// `ignore_ordering` additionally treats JSON array values as sets.
pub fn diff_responses(
    expected: &HttpResp,
    actual: &HttpResp,
    noise: &NoiseParams,
    ignore_ordering: bool,
) -> DiffOutcome {
    let status_code = StatusCodeResult {
        normal: expected.status_code == actual.status_code,
        expected: expected.status_code,
        actual: actual.status_code,
    };

    let headers = diff_headers(expected, actual, noise);
    let headers_normal = headers.iter().all(|h| h.normal);

    let body = diff_bodies(expected, actual, noise, ignore_ordering);

    DiffOutcome {
        passed: status_code.normal && headers_normal && body.normal,
        status_code,
        headers,
        body,
    }
}

fn is_noise_header(noise: &NoiseParams, name: &str) -> bool {
    noise.keys().any(|k| {
        k.eq_ignore_ascii_case("header")
            || k.strip_prefix("header.")
                .is_some_and(|h| h.eq_ignore_ascii_case(name))
    })
}

fn diff_headers(expected: &HttpResp, actual: &HttpResp, noise: &NoiseParams) -> Vec<HeaderResult> {
    let mut results = Vec::new();

    for (name, values) in &expected.header {
        let actual_values = actual
            .header
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
            .unwrap_or_default();
        let normal = is_noise_header(noise, name) || *values == actual_values;
        results.push(HeaderResult {
            normal,
            key: name.clone(),
            expected: values.clone(),
            actual: actual_values,
        });
    }

    for (name, values) in &actual.header {
        let known = expected
            .header
            .keys()
            .any(|k| k.eq_ignore_ascii_case(name));
        if !known {
            results.push(HeaderResult {
                normal: is_noise_header(noise, name),
                key: name.clone(),
                expected: Vec::new(),
                actual: values.clone(),
            });
        }
    }

    results
}

fn diff_bodies(
    expected: &HttpResp,
    actual: &HttpResp,
    noise: &NoiseParams,
    ignore_ordering: bool,
) -> BodyResult {
    let expected_text = String::from_utf8_lossy(&expected.body).to_string();
    let actual_text = String::from_utf8_lossy(&actual.body).to_string();

    if noise.keys().any(|k| k == "body") {
        return BodyResult {
            normal: true,
            expected: expected_text,
            actual: actual_text,
        };
    }

    let normal = match (flatten_body(&expected.body), flatten_body(&actual.body)) {
        (Some(mut a), Some(mut b)) => {
            for key in noise.keys().filter(|k| k.starts_with("body.")) {
                a.remove(key);
                b.remove(key);
            }
            if ignore_ordering {
                for values in a.values_mut().chain(b.values_mut()) {
                    values.sort();
                }
            }
            a == b
        }
        _ => expected.body == actual.body,
    };

    BodyResult {
        normal,
        expected: expected_text,
        actual: actual_text,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn resp(status: u16, body: &[u8], headers: &[(&str, &str)]) -> HttpResp {
        let mut header = BTreeMap::new();
        for (k, v) in headers {
            header.insert(k.to_string(), vec![v.to_string()]);
        }
        HttpResp {
            status_code: status,
            status_message: String::new(),
            proto_major: 1,
            proto_minor: 1,
            header,
            body: body.to_vec(),
        }
    }

    #[test]
    fn identical_responses_pass() {
        let a = resp(200, b"[]", &[("Content-Type", "application/json")]);
        let outcome = diff_responses(&a, &a.clone(), &NoiseParams::new(), false);
        assert!(outcome.passed);
        assert!(outcome.status_code.normal);
        assert!(outcome.body.normal);
    }

    #[test]
    fn status_difference_fails() {
        let expected = resp(200, b"[]", &[]);
        let actual = resp(500, b"[]", &[]);
        let outcome = diff_responses(&expected, &actual, &NoiseParams::new(), false);
        assert!(!outcome.passed);
        assert!(!outcome.status_code.normal);
    }

    #[test]
    fn changed_date_header_fails_without_noise_and_passes_with_it() {
        let expected = resp(200, b"[]", &[("Date", "Mon, 01 Jan 2024 00:00:00 GMT")]);
        let actual = resp(200, b"[]", &[("Date", "Tue, 02 Jan 2024 09:30:00 GMT")]);

        let strict = diff_responses(&expected, &actual, &NoiseParams::new(), false);
        assert!(!strict.passed);
        let date_result = strict.headers.iter().find(|h| h.key == "Date").unwrap();
        assert!(!date_result.normal);

        let noise = NoiseParams::from([("header.Date".to_string(), Vec::new())]);
        let masked = diff_responses(&expected, &actual, &noise, false);
        assert!(masked.passed);
    }

    #[test]
    fn header_missing_from_actual_fails() {
        let expected = resp(200, b"[]", &[("X-Request-Id", "abc")]);
        let actual = resp(200, b"[]", &[]);
        let outcome = diff_responses(&expected, &actual, &NoiseParams::new(), false);
        assert!(!outcome.passed);
    }

    #[test]
    fn json_bodies_compare_structurally() {
        let expected = resp(200, br#"{"a":1,"b":2}"#, &[]);
        let actual = resp(200, br#"{"b":2,"a":1}"#, &[]);
        assert!(diff_responses(&expected, &actual, &NoiseParams::new(), false).passed);
    }

    #[test]
    fn noise_body_path_masks_field() {
        let expected = resp(200, br#"{"id":1,"token":"aaa"}"#, &[]);
        let actual = resp(200, br#"{"id":1,"token":"bbb"}"#, &[]);
        let noise = NoiseParams::from([("body.token".to_string(), Vec::new())]);
        assert!(!diff_responses(&expected, &actual, &NoiseParams::new(), false).passed);
        assert!(diff_responses(&expected, &actual, &noise, false).passed);
    }

    #[test]
    fn ignore_ordering_treats_arrays_as_sets() {
        let expected = resp(200, br#"{"ids":[1,2,3]}"#, &[]);
        let actual = resp(200, br#"{"ids":[3,1,2]}"#, &[]);
        assert!(!diff_responses(&expected, &actual, &NoiseParams::new(), false).passed);
        assert!(diff_responses(&expected, &actual, &NoiseParams::new(), true).passed);
    }

    #[test]
    fn non_json_bodies_compare_bytewise() {
        let expected = resp(200, b"hello", &[]);
        let actual = resp(200, b"hellO", &[]);
        assert!(!diff_responses(&expected, &actual, &NoiseParams::new(), false).passed);
    }
}
