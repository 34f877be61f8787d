//! Error taxonomy for the outgoing payment engine
//!
//! Command errors are returned synchronously to callers. Stream-layer errors
//! are classified and drive the lifecycle state machine; whichever error
//! cancels a payment is persisted on the row as a stable string code.
//! Anything unclassified rolls the transaction back and retries implicitly.

use thiserror::Error;
use uuid::Uuid;

use crate::state::PaymentState;

/// Errors surfaced from `create`
#[derive(Debug, Error)]
pub enum CreateError {
    /// The super account does not resolve via the account service
    #[error("unknown super account")]
    UnknownAccount,

    /// The funding mandate does not resolve
    #[error("unknown mandate")]
    UnknownMandate,

    /// The intent failed validation
    #[error("invalid intent: {0}")]
    InvalidIntent(String),

    /// Infrastructure fault; safe to retry the call
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Errors surfaced from the mutating commands other than `create`
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("payment not found: {0}")]
    UnknownPayment(Uuid),

    /// The payment is not in the state the command requires
    #[error("wrong state: expected {expected}, found {actual}")]
    WrongState {
        expected: PaymentState,
        actual: PaymentState,
    },

    /// Funding amount below the quoted maximum source amount
    #[error("insufficient funds: amount below quoted maximum source amount")]
    InsufficientFunds,

    /// The quote's activation deadline has passed
    #[error("quote expired")]
    QuoteExpired,

    /// The funding transfer was refused by the accounting service
    #[error("funding transfer failed: {0}")]
    Funding(#[from] AccountingError),

    /// Infrastructure fault; safe to retry the call
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// How a stream-layer failure drives the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Client-caused; cancel the payment, carrying the error code
    Terminal,
    /// Transient; retry in-state up to the configured bound
    Retryable,
    /// The payment's goal is already met; complete without further effects
    Done,
}

/// The closed error set reported by the streaming layer
///
/// The string codes are wire-stable: they are persisted on cancelled rows and
/// exchanged with the stream daemon, so variants map 1:1 to their names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StreamError {
    // Terminal, client-caused
    #[error("invalid payment pointer")]
    InvalidPaymentPointer,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("unknown source asset")]
    UnknownSourceAsset,
    #[error("unknown payment target")]
    UnknownPaymentTarget,
    #[error("invalid source amount")]
    InvalidSourceAmount,
    #[error("invalid destination amount")]
    InvalidDestinationAmount,
    #[error("delivery cannot be enforced by receipts")]
    UnenforceableDelivery,
    #[error("destination query failed")]
    QueryFailed,

    // The invoice was paid before (or while) we tried; nothing left to do
    #[error("invoice already paid")]
    InvoiceAlreadyPaid,

    // Retryable, server-side or transient
    #[error("invalid slippage")]
    InvalidSlippage,
    #[error("invalid quote")]
    InvalidQuote,
    #[error("connector error")]
    ConnectorError,
    #[error("connection establishment failed")]
    EstablishmentFailed,
    #[error("unknown destination asset")]
    UnknownDestinationAsset,
    #[error("destination asset conflict")]
    DestinationAssetConflict,
    #[error("external exchange rate unavailable")]
    ExternalRateUnavailable,
    #[error("rate probe failed")]
    RateProbeFailed,
    #[error("insufficient exchange rate")]
    InsufficientExchangeRate,
    #[error("idle timeout")]
    IdleTimeout,
    #[error("connection closed by receiver")]
    ClosedByReceiver,
    #[error("incompatible receive maximum")]
    IncompatibleReceiveMax,
    #[error("receiver protocol violation")]
    ReceiverProtocolViolation,
    #[error("maximum safe encryption limit reached")]
    MaxSafeEncryptionLimit,
}

impl StreamError {
    /// Partition of the closed set into terminal / retryable / done
    pub fn classify(&self) -> ErrorClass {
        use StreamError::*;
        match self {
            InvalidPaymentPointer | InvalidCredentials | UnknownSourceAsset
            | UnknownPaymentTarget | InvalidSourceAmount | InvalidDestinationAmount
            | UnenforceableDelivery | QueryFailed => ErrorClass::Terminal,
            InvoiceAlreadyPaid => ErrorClass::Done,
            InvalidSlippage | InvalidQuote | ConnectorError | EstablishmentFailed
            | UnknownDestinationAsset | DestinationAssetConflict | ExternalRateUnavailable
            | RateProbeFailed | InsufficientExchangeRate | IdleTimeout | ClosedByReceiver
            | IncompatibleReceiveMax | ReceiverProtocolViolation | MaxSafeEncryptionLimit => {
                ErrorClass::Retryable
            }
        }
    }

    /// Stable code persisted on the row and used on the wire
    pub fn code(&self) -> &'static str {
        use StreamError::*;
        match self {
            InvalidPaymentPointer => "InvalidPaymentPointer",
            InvalidCredentials => "InvalidCredentials",
            UnknownSourceAsset => "UnknownSourceAsset",
            UnknownPaymentTarget => "UnknownPaymentTarget",
            InvalidSourceAmount => "InvalidSourceAmount",
            InvalidDestinationAmount => "InvalidDestinationAmount",
            UnenforceableDelivery => "UnenforceableDelivery",
            QueryFailed => "QueryFailed",
            InvoiceAlreadyPaid => "InvoiceAlreadyPaid",
            InvalidSlippage => "InvalidSlippage",
            InvalidQuote => "InvalidQuote",
            ConnectorError => "ConnectorError",
            EstablishmentFailed => "EstablishmentFailed",
            UnknownDestinationAsset => "UnknownDestinationAsset",
            DestinationAssetConflict => "DestinationAssetConflict",
            ExternalRateUnavailable => "ExternalRateUnavailable",
            RateProbeFailed => "RateProbeFailed",
            InsufficientExchangeRate => "InsufficientExchangeRate",
            IdleTimeout => "IdleTimeout",
            ClosedByReceiver => "ClosedByReceiver",
            IncompatibleReceiveMax => "IncompatibleReceiveMax",
            ReceiverProtocolViolation => "ReceiverProtocolViolation",
            MaxSafeEncryptionLimit => "MaxSafeEncryptionLimit",
        }
    }

    /// Decode a wire code; unknown codes return `None`
    pub fn from_code(code: &str) -> Option<StreamError> {
        use StreamError::*;
        Some(match code {
            "InvalidPaymentPointer" => InvalidPaymentPointer,
            "InvalidCredentials" => InvalidCredentials,
            "UnknownSourceAsset" => UnknownSourceAsset,
            "UnknownPaymentTarget" => UnknownPaymentTarget,
            "InvalidSourceAmount" => InvalidSourceAmount,
            "InvalidDestinationAmount" => InvalidDestinationAmount,
            "UnenforceableDelivery" => UnenforceableDelivery,
            "QueryFailed" => QueryFailed,
            "InvoiceAlreadyPaid" => InvoiceAlreadyPaid,
            "InvalidSlippage" => InvalidSlippage,
            "InvalidQuote" => InvalidQuote,
            "ConnectorError" => ConnectorError,
            "EstablishmentFailed" => EstablishmentFailed,
            "UnknownDestinationAsset" => UnknownDestinationAsset,
            "DestinationAssetConflict" => DestinationAssetConflict,
            "ExternalRateUnavailable" => ExternalRateUnavailable,
            "RateProbeFailed" => RateProbeFailed,
            "InsufficientExchangeRate" => InsufficientExchangeRate,
            "IdleTimeout" => IdleTimeout,
            "ClosedByReceiver" => ClosedByReceiver,
            "IncompatibleReceiveMax" => IncompatibleReceiveMax,
            "ReceiverProtocolViolation" => ReceiverProtocolViolation,
            "MaxSafeEncryptionLimit" => MaxSafeEncryptionLimit,
            _ => return None,
        })
    }
}

/// Engine-originated reasons a payment was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("cancelled by api")]
    CancelledByApi,
    #[error("quote activation deadline passed")]
    QuoteExpired,
    #[error("retries exhausted")]
    RetriesExhausted,
    #[error("quoting failed")]
    QuoteFailed,
    #[error("sending failed")]
    SendFailed,
}

impl LifecycleError {
    /// Stable code persisted on the row
    pub fn code(&self) -> &'static str {
        match self {
            LifecycleError::CancelledByApi => "CancelledByAPI",
            LifecycleError::QuoteExpired => "QuoteExpired",
            LifecycleError::RetriesExhausted => "RetriesExhausted",
            LifecycleError::QuoteFailed => "QuoteFailed",
            LifecycleError::SendFailed => "SendFailed",
        }
    }
}

/// Accounting service failures
#[derive(Debug, Error)]
pub enum AccountingError {
    #[error("accounting service unreachable: {0}")]
    Unreachable(String),

    #[error("unknown accounting account")]
    UnknownAccount,

    /// The transfer was refused (e.g. insufficient super-account balance)
    #[error("transfer rejected: {0}")]
    Rejected(String),
}

impl AccountingError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AccountingError::Unreachable(_))
    }
}

/// Rates service failures; prices are advisory, so these are always transient
#[derive(Debug, Error)]
pub enum RatesError {
    #[error("rates unavailable: {0}")]
    Unavailable(String),
}

/// Account service failures
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("account service unreachable: {0}")]
    Unreachable(String),

    #[error("unknown account")]
    UnknownAccount,
}

/// Plugin open/close failures; always treated as transient establishment faults
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("failed to open plugin: {0}")]
    Open(String),

    #[error("failed to close plugin: {0}")]
    Close(String),
}
