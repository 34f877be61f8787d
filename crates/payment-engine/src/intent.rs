//! User payment intents

use serde::{Deserialize, Serialize};

/// What the user asked the engine to do
///
/// Exactly one variant is present per payment; the flag controlling automatic
/// approval lives on the payment itself, not on the intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Intent {
    /// Send a fixed source amount to a payment pointer
    FixedSend {
        payment_pointer: String,
        /// Source amount in the source asset's minor units
        amount_to_send: u64,
    },
    /// Pay an invoice in full; the delivery amount comes from the invoice
    Invoice { invoice_url: String },
}

impl Intent {
    /// Validate the intent before admission
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Intent::FixedSend {
                payment_pointer,
                amount_to_send,
            } => {
                if payment_pointer.is_empty() {
                    return Err("payment pointer must not be empty".to_string());
                }
                if *amount_to_send == 0 {
                    return Err("amount to send must be positive".to_string());
                }
                Ok(())
            }
            Intent::Invoice { invoice_url } => {
                if invoice_url.is_empty() {
                    return Err("invoice url must not be empty".to_string());
                }
                Ok(())
            }
        }
    }

    pub fn payment_pointer(&self) -> Option<&str> {
        match self {
            Intent::FixedSend {
                payment_pointer, ..
            } => Some(payment_pointer),
            Intent::Invoice { .. } => None,
        }
    }

    pub fn invoice_url(&self) -> Option<&str> {
        match self {
            Intent::FixedSend { .. } => None,
            Intent::Invoice { invoice_url } => Some(invoice_url),
        }
    }

    pub fn amount_to_send(&self) -> Option<u64> {
        match self {
            Intent::FixedSend { amount_to_send, .. } => Some(*amount_to_send),
            Intent::Invoice { .. } => None,
        }
    }
}
