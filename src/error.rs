use std::{io, path::PathBuf, time::Duration};

use axum::{
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error as ThisError;

pub const MISSING_UPLOADS_MESSAGE: &str = "Both .img and .hdr files are required";
pub const PARSE_FAILURE_MESSAGE: &str = "Error parsing Python response";

#[derive(ThisError, Debug)]
pub enum Error {
    /// The `img` part, the `hdr` part, or both were absent
    #[error("{}", MISSING_UPLOADS_MESSAGE)]
    MissingUploads,

    /// The multipart body could not be read
    #[error(transparent)]
    Multipart(#[from] MultipartError),

    #[error("failed to write upload to {}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn predictor `{program}`")]
    PredictorLaunch {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed while waiting for the predictor")]
    PredictorWait(#[source] io::Error),

    #[error("predictor did not exit within {0:?}")]
    PredictorTimeout(Duration),

    /// Standard output was empty, truncated or not JSON
    #[error("{}", PARSE_FAILURE_MESSAGE)]
    PredictorOutput { details: String },
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a str>,
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::MissingUploads => StatusCode::BAD_REQUEST,
            Error::Multipart(err) => err.status(),
            Error::Storage { .. }
            | Error::PredictorLaunch { .. }
            | Error::PredictorWait(_)
            | Error::PredictorTimeout(_)
            | Error::PredictorOutput { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to hand back to the caller. Paths and io errors stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            Error::MissingUploads => MISSING_UPLOADS_MESSAGE.to_string(),
            Error::Multipart(err) => err.body_text(),
            Error::Storage { .. } => "Failed to store uploaded files".to_string(),
            Error::PredictorLaunch { .. } => "Failed to start predictor".to_string(),
            Error::PredictorWait(_) => "Predictor process failed".to_string(),
            Error::PredictorTimeout(_) => "Predictor timed out".to_string(),
            Error::PredictorOutput { .. } => PARSE_FAILURE_MESSAGE.to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::MissingUploads | Error::Multipart(_) => {
                tracing::debug!("Client error: {}", self);
            }
            Error::PredictorOutput { details } => {
                tracing::error!(raw_output = %details, "{}", self);
            }
            _ => {
                let cause = std::error::Error::source(&self).map(ToString::to_string);
                tracing::error!(cause = ?cause, "Internal service error: {}", self);
            }
        }

        let status = self.status_code();
        let message = self.user_message();
        let details = match &self {
            Error::PredictorOutput { details } => Some(details.as_str()),
            _ => None,
        };

        (
            status,
            Json(ErrorBody {
                error: &message,
                details,
            }),
        )
            .into_response()
    }
}
