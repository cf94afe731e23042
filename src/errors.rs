//! The error taxonomy shared by the pipeline, the HTTP layer and the
//! persistence row.
//!
//! Every failure the service can surface is identified by an [`ErrorCode`].
//! The code determines the category (client/server/business), the default
//! retryability, the HTTP status used for RFC-7807 responses, and the
//! localized message attached for display. Business codes are never raised
//! as errors; the validator accumulates them as data.

use axum::http::StatusCode;

use crate::prelude::*;

/// Canonical machine-readable error codes, as emitted in responses and
/// persisted with each run.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorCode {
    // Business rules.
    FioMismatch,
    FioMissing,
    DocTypeUnknown,
    MultipleDocTypes,
    DocDateMissing,
    DocDateTooOld,
    // Client failures.
    ValidationError,
    PdfTooManyPages,
    UnsupportedMediaType,
    PayloadTooLarge,
    ResourceNotFound,
    MultipleDocuments,
    // Server failures.
    OcrFailed,
    OcrEmptyPages,
    OcrTimeout,
    LlmFailed,
    LlmTimeout,
    LlmFilterParseError,
    DtcFailed,
    DtcParseError,
    ExtractFailed,
    ExtractSchemaInvalid,
    S3Error,
    FileSaveFailed,
    ValidationFailed,
    ServiceUnavailable,
    RequestTimeout,
    InternalError,
}

/// Which side of the contract a failure belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    ClientError,
    ServerError,
    BusinessError,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::ClientError => "client_error",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::BusinessError => "business_error",
        }
    }
}

impl ErrorCode {
    /// The canonical wire spelling of this code.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::FioMismatch => "FIO_MISMATCH",
            ErrorCode::FioMissing => "FIO_MISSING",
            ErrorCode::DocTypeUnknown => "DOC_TYPE_UNKNOWN",
            ErrorCode::MultipleDocTypes => "MULTIPLE_DOC_TYPES",
            ErrorCode::DocDateMissing => "DOC_DATE_MISSING",
            ErrorCode::DocDateTooOld => "DOC_DATE_TOO_OLD",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::PdfTooManyPages => "PDF_TOO_MANY_PAGES",
            ErrorCode::UnsupportedMediaType => "UNSUPPORTED_MEDIA_TYPE",
            ErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ErrorCode::ResourceNotFound => "RESOURCE_NOT_FOUND",
            ErrorCode::MultipleDocuments => "MULTIPLE_DOCUMENTS",
            ErrorCode::OcrFailed => "OCR_FAILED",
            ErrorCode::OcrEmptyPages => "OCR_EMPTY_PAGES",
            ErrorCode::OcrTimeout => "OCR_TIMEOUT",
            ErrorCode::LlmFailed => "LLM_FAILED",
            ErrorCode::LlmTimeout => "LLM_TIMEOUT",
            ErrorCode::LlmFilterParseError => "LLM_FILTER_PARSE_ERROR",
            ErrorCode::DtcFailed => "DTC_FAILED",
            ErrorCode::DtcParseError => "DTC_PARSE_ERROR",
            ErrorCode::ExtractFailed => "EXTRACT_FAILED",
            ErrorCode::ExtractSchemaInvalid => "EXTRACT_SCHEMA_INVALID",
            ErrorCode::S3Error => "S3_ERROR",
            ErrorCode::FileSaveFailed => "FILE_SAVE_FAILED",
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// The category this code belongs to.
    pub fn category(self) -> ErrorCategory {
        use ErrorCode::*;
        match self {
            FioMismatch | FioMissing | DocTypeUnknown | MultipleDocTypes
            | DocDateMissing | DocDateTooOld => ErrorCategory::BusinessError,
            ValidationError | PdfTooManyPages | UnsupportedMediaType
            | PayloadTooLarge | ResourceNotFound | MultipleDocuments => {
                ErrorCategory::ClientError
            }
            _ => ErrorCategory::ServerError,
        }
    }

    /// Is a failed call with this code worth retrying upstream?
    pub fn default_retryable(self) -> bool {
        use ErrorCode::*;
        matches!(
            self,
            OcrFailed | OcrTimeout | LlmFailed | LlmTimeout | S3Error
        )
    }

    /// The HTTP status used when this code is surfaced as a system error.
    ///
    /// Business codes never travel as problem responses; they map to 200
    /// with `verdict=false` and only hit this table through the safety-net
    /// arm.
    pub fn http_status(self) -> StatusCode {
        use ErrorCode::*;
        match self {
            ValidationError | PdfTooManyPages | MultipleDocuments => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ResourceNotFound => StatusCode::NOT_FOUND,
            OcrFailed | LlmFailed | LlmFilterParseError | DtcFailed
            | DtcParseError | ExtractFailed | ExtractSchemaInvalid | S3Error => {
                StatusCode::BAD_GATEWAY
            }
            OcrTimeout | LlmTimeout | RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Localized message for human display. Error codes stay stable and
    /// machine-readable; these strings are what end users see.
    pub fn message_ru(self) -> &'static str {
        use ErrorCode::*;
        match self {
            FioMismatch => "ФИО в документе не совпадает с заявленным",
            FioMissing => "ФИО не указано или не найдено в документе",
            DocTypeUnknown => "Не удалось определить тип документа",
            MultipleDocTypes => "Файл содержит документы нескольких типов",
            DocDateMissing => "В документе не найдена дата",
            DocDateTooOld => "Срок действия документа истёк",
            ValidationError => "Некорректные параметры запроса",
            PdfTooManyPages => "Документ содержит слишком много страниц",
            UnsupportedMediaType => "Неподдерживаемый формат файла",
            PayloadTooLarge => "Файл превышает допустимый размер",
            ResourceNotFound => "Файл не найден в хранилище",
            MultipleDocuments => "Файл содержит несколько разных документов",
            OcrFailed => "Ошибка сервиса распознавания",
            OcrEmptyPages => "Не удалось распознать текст документа",
            OcrTimeout => "Превышено время ожидания распознавания",
            LlmFailed => "Ошибка сервиса анализа документа",
            LlmTimeout => "Превышено время ожидания анализа документа",
            LlmFilterParseError => "Не удалось обработать ответ сервиса анализа",
            DtcFailed => "Ошибка определения типа документа",
            DtcParseError => "Не удалось обработать результат классификации",
            ExtractFailed => "Ошибка извлечения данных из документа",
            ExtractSchemaInvalid => "Некорректный результат извлечения данных",
            S3Error => "Ошибка доступа к хранилищу файлов",
            FileSaveFailed => "Не удалось сохранить файл",
            ValidationFailed => "Ошибка проверки документа",
            ServiceUnavailable => "Сервис временно недоступен",
            RequestTimeout => "Превышено время обработки запроса",
            InternalError => "Внутренняя ошибка сервиса",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// A typed stage failure. Carries everything the orchestrator needs to
/// finalize the run: the code, its category, whether the caller may retry,
/// a technical detail string, and an optional retry hint.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {detail}")]
pub struct PipelineError {
    pub code: ErrorCode,
    pub category: ErrorCategory,
    pub retryable: bool,
    pub detail: String,
    /// Suggested client back-off, surfaced as a `Retry-After` header.
    pub retry_after: Option<Duration>,
    /// The underlying cause, kept for logs only.
    pub cause: Option<anyhow::Error>,
}

impl PipelineError {
    /// Create a failure with the code's default category and retryability.
    pub fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            category: code.category(),
            retryable: code.default_retryable(),
            detail: detail.into(),
            retry_after: None,
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: anyhow::Error) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn not_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    /// Full detail including the cause chain, for logs and problem bodies.
    pub fn full_detail(&self) -> String {
        match &self.cause {
            Some(cause) => format!("{}: {:#}", self.detail, cause),
            None => self.detail.clone(),
        }
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::new(ErrorCode::InternalError, "unexpected failure")
            .with_cause(err)
    }
}

/// A business-rule violation. Not an error type in the exception sense;
/// the validator returns these as data and they ride in the `errors` field
/// of a 200 response.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct CheckError {
    pub code: ErrorCode,
    pub message: Option<String>,
}

impl CheckError {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            message: Some(code.message_ru().to_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(
            ErrorCode::FioMismatch.category(),
            ErrorCategory::BusinessError
        );
        assert_eq!(
            ErrorCode::PdfTooManyPages.category(),
            ErrorCategory::ClientError
        );
        assert_eq!(ErrorCode::OcrFailed.category(), ErrorCategory::ServerError);
        assert_eq!(
            ErrorCode::ServiceUnavailable.category(),
            ErrorCategory::ServerError
        );
    }

    #[test]
    fn test_http_mapping() {
        assert_eq!(
            ErrorCode::ResourceNotFound.http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ErrorCode::PayloadTooLarge.http_status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(ErrorCode::OcrFailed.http_status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            ErrorCode::LlmTimeout.http_status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ErrorCode::ServiceUnavailable.http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ErrorCode::InternalError.http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_retryable_defaults() {
        assert!(ErrorCode::OcrFailed.default_retryable());
        assert!(ErrorCode::S3Error.default_retryable());
        assert!(!ErrorCode::ResourceNotFound.default_retryable());
        assert!(!ErrorCode::ServiceUnavailable.default_retryable());
    }

    #[test]
    fn test_wire_spelling() {
        assert_eq!(ErrorCode::DocDateTooOld.as_str(), "DOC_DATE_TOO_OLD");
        assert_eq!(
            serde_json::to_value(ErrorCode::FioMismatch).unwrap(),
            json!("FIO_MISMATCH")
        );
    }
}
