use ember::BackendError;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A mutating operation was attempted with nobody signed in. The backend is never contacted.
    #[error("User not authenticated")]
    NotAuthenticated,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// What the JS side sees from every action: never an exception, always `{ success, error? }`.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[cfg_attr(target_arch = "wasm32", derive(tsify::Tsify))]
#[cfg_attr(target_arch = "wasm32", tsify(into_wasm_abi, from_wasm_abi))]
pub struct ActionResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> From<Result<T, Error>> for ActionResult {
    fn from(result: Result<T, Error>) -> Self {
        match result {
            Ok(_) => ActionResult {
                success: true,
                error: None,
            },
            Err(e) => ActionResult {
                success: false,
                error: Some(e.to_string()),
            },
        }
    }
}
