use thiserror::Error;

/// Failures surfaced to the presentation layer. Per-row call failures never
/// appear here; they are absorbed into the transient table.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatListError {
    #[error("Prompt is empty")]
    EmptyPrompt,
    #[error("No active models")]
    NoActiveModels,
    #[error("Credential `{0}` is not set")]
    MissingCredential(String),
    #[error("Results are still pending")]
    SaveWhilePending,
    #[error("No results selected")]
    NothingSelected,
    #[error("Row for `{0}` cannot be selected")]
    RowNotSelectable(String),
    #[error("Model `{0}` not found")]
    ModelNotFound(String),
    #[error("Invalid model configuration: {0}")]
    InvalidModel(String),
    #[error("Saved prompt #{0} not found")]
    PromptNotFound(i64),
    #[error("Failed to save results: {0}")]
    Persistence(String),
    #[error("Database unavailable")]
    DbUnavailable,
}

impl ChatListError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyPrompt => "DSP-1001",
            Self::NoActiveModels => "DSP-1002",
            Self::MissingCredential(_) => "REG-1001",
            Self::SaveWhilePending => "PRS-1001",
            Self::NothingSelected => "PRS-1002",
            Self::RowNotSelectable(_) => "DSP-1003",
            Self::ModelNotFound(_) => "REG-1002",
            Self::InvalidModel(_) => "REG-1003",
            Self::Persistence(_) => "PRS-1003",
            Self::PromptNotFound(_) => "PRS-1004",
            Self::DbUnavailable => "DB-1001",
        }
    }

    pub fn explain(&self) -> &'static str {
        match self {
            Self::EmptyPrompt => "Enter a prompt before sending it to the models.",
            Self::NoActiveModels => "Activate at least one model before sending a prompt.",
            Self::MissingCredential(_) => {
                "The environment variable referenced by the model has no value."
            }
            Self::SaveWhilePending => "Wait until every model has answered before saving.",
            Self::NothingSelected => "Select at least one successful response to save.",
            Self::RowNotSelectable(_) => "Only successful responses can be selected for saving.",
            Self::ModelNotFound(_) => "No model exists with the requested name or ID.",
            Self::InvalidModel(_) => "The model record is missing a name, URL or credential reference.",
            Self::PromptNotFound(_) => "No saved prompt exists with the requested ID.",
            Self::Persistence(_) => {
                "The results could not be written. Nothing was saved; the table is kept for retry."
            }
            Self::DbUnavailable => "The application could not access the SQLite database.",
        }
    }
}

impl From<r2d2::Error> for ChatListError {
    fn from(_: r2d2::Error) -> Self {
        Self::DbUnavailable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_unique() {
        let all = [
            ChatListError::EmptyPrompt,
            ChatListError::NoActiveModels,
            ChatListError::MissingCredential("X".into()),
            ChatListError::SaveWhilePending,
            ChatListError::NothingSelected,
            ChatListError::RowNotSelectable("m".into()),
            ChatListError::ModelNotFound("m".into()),
            ChatListError::InvalidModel("url".into()),
            ChatListError::Persistence("boom".into()),
            ChatListError::PromptNotFound(7),
            ChatListError::DbUnavailable,
        ];
        let mut codes: Vec<_> = all.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
    }

    #[test]
    fn display_includes_context() {
        let err = ChatListError::MissingCredential("OPENAI_API_KEY".into());
        assert_eq!(err.to_string(), "Credential `OPENAI_API_KEY` is not set");
    }
}
