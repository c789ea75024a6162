//! Launch parameters of a window, carried in its URL query string.

use paneweave_core_layout::WidgetKind;
use paneweave_ipc::BASE_MAIN_ID;
use std::collections::HashMap;
use thiserror::Error;

/// Errors parsing launch parameters.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LaunchError {
    #[error("Missing launch parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Invalid value for launch parameter {name}: {value}")]
    InvalidParameter { name: &'static str, value: String },
}

/// What a window was opened for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchParams {
    pub popout: bool,
    pub user_id: String,
    pub source_code: String,
    pub main_id: Option<String>,
    pub page: Option<WidgetKind>,
    pub room_id: Option<String>,
}

impl LaunchParams {
    /// Parameters of the base-main window.
    pub fn base_main(user_id: impl Into<String>, source_code: impl Into<String>) -> Self {
        Self {
            popout: false,
            user_id: user_id.into(),
            source_code: source_code.into(),
            main_id: None,
            page: None,
            room_id: None,
        }
    }

    /// Parse a query string such as `?popout=true&userId=u1&...`.
    pub fn from_query(query: &str) -> Result<Self, LaunchError> {
        let query = query.strip_prefix('?').unwrap_or(query);
        let mut pairs = HashMap::new();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            let value = urlencoding::decode(value)
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| value.to_string());
            pairs.insert(name.to_string(), value);
        }
        let take = |name: &str| pairs.get(name).filter(|v| !v.is_empty()).cloned();

        let popout = match take("popout").as_deref() {
            None | Some("false") => false,
            Some("true") => true,
            Some(other) => {
                return Err(LaunchError::InvalidParameter {
                    name: "popout",
                    value: other.to_string(),
                })
            }
        };

        let params = Self {
            popout,
            user_id: take("userId").ok_or(LaunchError::MissingParameter("userId"))?,
            source_code: take("sourceCode").ok_or(LaunchError::MissingParameter("sourceCode"))?,
            main_id: take("mainId"),
            page: take("page").map(WidgetKind::new),
            room_id: take("roomId"),
        };

        if !params.is_base_main() {
            if params.page.is_none() {
                return Err(LaunchError::MissingParameter("page"));
            }
            if params.room_id.is_none() {
                return Err(LaunchError::MissingParameter("roomId"));
            }
        }
        Ok(params)
    }

    /// Encode as a query string without the leading `?`.
    pub fn to_query(&self) -> String {
        let mut parts = vec![
            format!("popout={}", self.popout),
            format!("userId={}", urlencoding::encode(&self.user_id)),
            format!("sourceCode={}", urlencoding::encode(&self.source_code)),
        ];
        if let Some(page) = &self.page {
            parts.push(format!("page={}", urlencoding::encode(page.as_str())));
        }
        if let Some(room_id) = &self.room_id {
            parts.push(format!("roomId={}", urlencoding::encode(room_id)));
        }
        if let Some(main_id) = &self.main_id {
            parts.push(format!("mainId={}", urlencoding::encode(main_id)));
        }
        parts.join("&")
    }

    /// Full URL to open this window at.
    pub fn launch_url(&self, base_url: &str) -> String {
        format!("{}?{}", base_url, self.to_query())
    }

    /// Main id of the window, `main` when none was given.
    pub fn main_id(&self) -> &str {
        self.main_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .unwrap_or(BASE_MAIN_ID)
    }

    /// Whether these are the parameters of base-main.
    pub fn is_base_main(&self) -> bool {
        !self.popout && self.main_id() == BASE_MAIN_ID
    }
}
