use serde::{Deserialize, Serialize};

use crate::{error::SessionError, types::Address};

const MIN_ADDRESS_DIGITS: usize = 10;
const MAX_E164_DIGITS: usize = 15;

/// Rules used to turn free-form phone input into a transport address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRules {
    /// Country code prefixed onto local-length numbers.
    pub default_country_code: String,
    /// Digit count of a local number that lacks a country code.
    pub local_number_len: usize,
}

impl Default for AddressRules {
    fn default() -> Self {
        Self {
            default_country_code: "51".to_owned(),
            local_number_len: 9,
        }
    }
}

/// Normalize a recipient phone number into a transport address.
///
/// Input may contain digits, whitespace, `-`, `+`, `(` and `)`. Non-digits are
/// stripped and local-length numbers get the default country code.
pub fn normalize_address(input: &str, rules: &AddressRules) -> Result<Address, SessionError> {
    if let Some(bad) = input
        .chars()
        .find(|ch| !(ch.is_ascii_digit() || ch.is_whitespace() || "-+()".contains(*ch)))
    {
        return Err(SessionError::invalid_address(
            input,
            format!("unexpected character '{bad}'"),
        ));
    }

    let mut digits = strip_non_digits(input);
    if digits.len() == rules.local_number_len && !digits.starts_with(&rules.default_country_code)
    {
        digits.insert_str(0, &rules.default_country_code);
    }

    if digits.len() < MIN_ADDRESS_DIGITS {
        return Err(SessionError::invalid_address(
            input,
            format!("expected at least {MIN_ADDRESS_DIGITS} digits"),
        ));
    }

    Ok(Address::from_digits(digits))
}

/// Normalize a pairing phone number to E.164 digits without the leading `+`.
pub fn normalize_pairing_phone(input: &str) -> Result<String, SessionError> {
    let digits = strip_non_digits(input);
    let valid = (2..=MAX_E164_DIGITS).contains(&digits.len())
        && digits.as_bytes().first().is_some_and(|first| *first != b'0');
    if !valid {
        return Err(SessionError::invalid_phone_format(input));
    }
    Ok(digits)
}

fn strip_non_digits(input: &str) -> String {
    input.chars().filter(char::is_ascii_digit).collect()
}

/// Result of a send that reached the transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SendOutcome {
    /// The transport accepted the message and assigned an ID.
    Delivered { message_id: String },
    /// The transport refused or failed the send; the session stays up.
    Failed { error: SessionError },
}

impl SendOutcome {
    /// `true` for `Delivered`.
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }

    /// Message ID when delivered.
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Self::Delivered { message_id } => Some(message_id),
            Self::Failed { .. } => None,
        }
    }
}

/// Convert a transport send failure to a stable error payload.
pub fn classify_send_error_message(message: impl Into<String>) -> SessionError {
    SessionError::new(
        crate::error::SessionErrorCategory::Transport,
        "send_failed",
        message.into(),
    )
}
