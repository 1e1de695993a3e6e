//! REST boundary (§6): this crate does not host a REST server. It only
//! parses the `POST /model/{name}[/version/{n}]:{service_method}` URL
//! shape some servable clients use, translating it into the `(name,
//! version, method)` triple the gRPC `ServableSpec` needs — any actual
//! HTTP listener is the operator's reverse-proxy concern, not this
//! crate's.
use crate::error::ServingError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestPredictPath {
    pub servable_name: String,
    pub version_number: u64,
    pub method_name: String,
}

/// Parse a REST predict path of the form
/// `/model/{name}[/version/{n}]:{method}`.
pub fn parse_predict_path(path: &str) -> Result<RestPredictPath, ServingError> {
    let rest = path
        .strip_prefix("/model/")
        .ok_or_else(|| ServingError::InvalidInputs(format!("unrecognized REST path '{path}'")))?;

    let (resource, method_name) = rest
        .rsplit_once(':')
        .ok_or_else(|| ServingError::InvalidInputs(format!("missing method in REST path '{path}'")))?;

    if method_name.is_empty() {
        return Err(ServingError::InvalidInputs(format!(
            "empty method in REST path '{path}'"
        )));
    }

    let (servable_name, version_number) = match resource.split_once("/version/") {
        Some((name, version_str)) => {
            let version = version_str.parse::<u64>().map_err(|_| {
                ServingError::InvalidInputs(format!("invalid version number in path '{path}'"))
            })?;
            (name, version)
        }
        None => (resource, 0),
    };

    if servable_name.is_empty() {
        return Err(ServingError::InvalidInputs(format!(
            "empty servable name in REST path '{path}'"
        )));
    }

    Ok(RestPredictPath {
        servable_name: servable_name.to_string(),
        version_number,
        method_name: method_name.to_string(),
    })
}
