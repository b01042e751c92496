use std::fmt;

use tonic::metadata::MetadataValue;
use tonic::service::Interceptor;

const CLIENT_HEADER: &str = "x-rolegate-client";
const CLIENT_VERSION: &str = concat!("rolegate-client/", env!("CARGO_PKG_VERSION"));

/// Stamps every engine call with the client identity and, when configured,
/// a bearer token.
#[derive(Clone)]
pub struct EngineAuthInterceptor {
    bearer: Option<MetadataValue<tonic::metadata::Ascii>>,
}

impl fmt::Debug for EngineAuthInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineAuthInterceptor")
            .field("bearer", &self.bearer.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl EngineAuthInterceptor {
    /// Fails when the key cannot be carried in a header.
    pub fn new(api_key: Option<&str>) -> Result<Self, tonic::Status> {
        let bearer = api_key
            .map(|key| {
                format!("Bearer {key}")
                    .parse()
                    .map_err(|_| tonic::Status::internal("invalid api key format"))
            })
            .transpose()?;
        Ok(Self { bearer })
    }
}

impl Interceptor for EngineAuthInterceptor {
    fn call(
        &mut self,
        mut request: tonic::Request<()>,
    ) -> Result<tonic::Request<()>, tonic::Status> {
        let metadata = request.metadata_mut();
        metadata.insert(CLIENT_HEADER, MetadataValue::from_static(CLIENT_VERSION));
        if let Some(ref bearer) = self.bearer {
            metadata.insert("authorization", bearer.clone());
        }
        Ok(request)
    }
}
