use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TokenProviderError {
    #[error("no access token configured")]
    Missing,
    #[error("failed to read token file {path:?}: {source}")]
    TokenFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Supplies the bearer token for each sync invocation.
///
/// A token file takes precedence over the inline token and is re-read on
/// every call, so an external tool can rotate the credential without a
/// restart.
#[derive(Debug, Clone, Default)]
pub struct TokenProvider {
    token: Option<String>,
    token_file: Option<PathBuf>,
}

impl TokenProvider {
    pub fn new(token: Option<String>, token_file: Option<PathBuf>) -> Self {
        Self {
            token: token.filter(|token| !token.trim().is_empty()),
            token_file,
        }
    }

    pub fn from_token(token: impl Into<String>) -> Self {
        Self::new(Some(token.into()), None)
    }

    pub async fn valid_access_token(&self) -> Result<String, TokenProviderError> {
        if let Some(path) = &self.token_file {
            match tokio::fs::read_to_string(path).await {
                Ok(contents) => {
                    let token = contents.trim();
                    if !token.is_empty() {
                        return Ok(token.to_string());
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(TokenProviderError::TokenFile {
                        path: path.clone(),
                        source,
                    });
                }
            }
        }
        self.token
            .as_ref()
            .map(|token| token.trim().to_string())
            .ok_or(TokenProviderError::Missing)
    }
}
