//! CloudEvents correlation headers
//!
//! Requests and responses carry a fixed set of `Ce-*` headers in their
//! parameter bag so that downstream event consumers can correlate them.

use tensorserve_proto::{Headers, InferenceRequest, InferenceResponse, Parameters};

pub const CE_SPECVERSION: &str = "Ce-Specversion";
pub const CE_SOURCE: &str = "Ce-Source";
pub const CE_TYPE: &str = "Ce-Type";
pub const CE_MODELID: &str = "Ce-Modelid";
pub const CE_INFERENCESERVICENAME: &str = "Ce-Inferenceservicename";
pub const CE_ENDPOINT: &str = "Ce-Endpoint";
pub const CE_ID: &str = "Ce-Id";
pub const CE_REQUESTID: &str = "Ce-Requestid";

pub const SPEC_VERSION: &str = "0.3";
pub const REQUEST_EVENT: &str = "io.tensorserve.serving.inference.request";
pub const RESPONSE_EVENT: &str = "io.tensorserve.serving.inference.response";

/// Which side of the exchange the headers describe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Request,
    Response,
}

impl EventKind {
    fn event_type(&self) -> &'static str {
        match self {
            EventKind::Request => REQUEST_EVENT,
            EventKind::Response => RESPONSE_EVENT,
        }
    }
}

/// The full `Ce-*` header set for one request id
pub fn cloud_event_headers(server_name: &str, model_name: &str, request_id: &str, kind: EventKind) -> Headers {
    let mut headers = Headers::new();
    headers.insert(CE_SPECVERSION.to_string(), SPEC_VERSION.to_string());
    headers.insert(
        CE_SOURCE.to_string(),
        format!("io.tensorserve.serving.deployment.{}", server_name),
    );
    headers.insert(CE_TYPE.to_string(), kind.event_type().to_string());
    headers.insert(CE_MODELID.to_string(), model_name.to_string());
    headers.insert(CE_INFERENCESERVICENAME.to_string(), server_name.to_string());
    headers.insert(CE_ENDPOINT.to_string(), model_name.to_string());
    headers.insert(CE_ID.to_string(), request_id.to_string());
    headers.insert(CE_REQUESTID.to_string(), request_id.to_string());
    headers
}

/// Add headers to a request, keeping any value the caller already set
pub fn insert_headers(request: &mut InferenceRequest, headers: Headers) {
    let bag = request.headers_mut();
    for (key, value) in headers {
        bag.entry(key).or_insert(value);
    }
}

/// Set headers on a response, replacing existing values
pub fn set_headers(response: &mut InferenceResponse, headers: Headers) {
    response.headers_mut().extend(headers);
}

/// Take the header bag out of a response so a transport can emit it
pub fn extract_headers(response: &mut InferenceResponse) -> Headers {
    let headers = response
        .parameters
        .as_mut()
        .and_then(|parameters| parameters.headers.take())
        .unwrap_or_default();

    if response.parameters.as_ref() == Some(&Parameters::default()) {
        response.parameters = None;
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_headers_do_not_overwrite() {
        let mut request = InferenceRequest::default();
        request
            .headers_mut()
            .insert(CE_ID.to_string(), "caller-id".to_string());

        insert_headers(&mut request, cloud_event_headers("tensorserve", "iris", "generated", EventKind::Request));

        let headers = request.headers().unwrap();
        assert_eq!(headers[CE_ID], "caller-id");
        assert_eq!(headers[CE_REQUESTID], "generated");
        assert_eq!(headers[CE_TYPE], REQUEST_EVENT);
        assert_eq!(headers[CE_SOURCE], "io.tensorserve.serving.deployment.tensorserve");
    }

    #[test]
    fn test_response_headers_are_extracted() {
        let mut response = InferenceResponse::new("iris", vec![]);
        set_headers(&mut response, cloud_event_headers("tensorserve", "iris", "abc", EventKind::Response));

        let headers = extract_headers(&mut response);
        assert_eq!(headers.len(), 8);
        assert_eq!(headers[CE_TYPE], RESPONSE_EVENT);
        assert_eq!(headers[CE_MODELID], "iris");
        assert!(response.parameters.is_none());
        assert!(extract_headers(&mut response).is_empty());
    }
}
