//! Static event contract: subject → payload schema.
//!
//! Publishers and listeners both check payloads against the schema of their
//! subject before anything crosses the bus boundary. The mapping is a plain
//! exhaustive `match`, so there is no registry to populate at startup and no
//! way to forget a subject.
//!
//! # Example
//!
//! ```
//! use ticketbus_core::contract::schema_for_name;
//!
//! let schema = schema_for_name("expiration:complete").unwrap();
//! assert!(schema.validate(&serde_json::json!({ "orderId": "o-1" })).is_ok());
//! assert!(schema.validate(&serde_json::json!({})).is_err());
//! assert!(schema_for_name("ticket:deleted").is_err());
//! ```

use crate::subject::Subject;
use serde_json::Value;
use thiserror::Error;

/// Errors raised while resolving or checking an event contract.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContractError {
    /// Subject is not part of the closed enumeration.
    #[error("Unknown subject: {0}")]
    UnknownSubject(String),

    /// A required field is absent (or null).
    #[error("{subject}: missing required field '{field}'")]
    MissingField {
        /// Subject whose schema was violated
        subject: Subject,
        /// Dotted path of the field
        field: String,
    },

    /// A field is present with the wrong JSON kind or an invalid value.
    #[error("{subject}: field '{field}' must be {expected}")]
    InvalidField {
        /// Subject whose schema was violated
        subject: Subject,
        /// Dotted path of the field
        field: String,
        /// Human-readable description of the expected kind
        expected: &'static str,
    },

    /// Payload is not a JSON object or could not be decoded at all.
    #[error("{subject}: malformed payload: {reason}")]
    Malformed {
        /// Subject the payload was decoded against
        subject: Subject,
        /// Decoder message
        reason: String,
    },
}

/// JSON kind accepted for a field.
#[derive(Debug, Clone, Copy)]
pub enum FieldKind {
    /// Non-empty string.
    String,
    /// Integer ≥ 0.
    NonNegativeInteger,
    /// RFC 3339 timestamp string.
    Timestamp,
    /// One of a fixed set of strings.
    OneOf(&'static [&'static str]),
    /// Nested object with its own fields.
    Object(&'static [Field]),
}

impl FieldKind {
    const fn describe(self) -> &'static str {
        match self {
            Self::String => "a non-empty string",
            Self::NonNegativeInteger => "a non-negative integer",
            Self::Timestamp => "an RFC 3339 timestamp",
            Self::OneOf(_) => "one of the enumerated values",
            Self::Object(_) => "an object",
        }
    }
}

/// A single field of a payload schema.
#[derive(Debug, Clone, Copy)]
pub struct Field {
    /// Wire name of the field.
    pub name: &'static str,
    /// Accepted kind.
    pub kind: FieldKind,
    /// Whether the field must be present and non-null.
    pub required: bool,
}

impl Field {
    const fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    const fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}

/// Payload schema of one subject.
#[derive(Debug)]
pub struct Schema {
    /// Subject described by this schema.
    pub subject: Subject,
    /// Top-level fields. Unknown extra fields are tolerated.
    pub fields: &'static [Field],
}

impl Schema {
    /// Check a JSON payload against this schema.
    ///
    /// # Errors
    ///
    /// Returns the first violation found: [`ContractError::Malformed`] if the
    /// payload is not an object, otherwise [`ContractError::MissingField`] or
    /// [`ContractError::InvalidField`].
    pub fn validate(&self, payload: &Value) -> Result<(), ContractError> {
        let Some(object) = payload.as_object() else {
            return Err(ContractError::Malformed {
                subject: self.subject,
                reason: "payload is not a JSON object".to_string(),
            });
        };
        check_fields(self.subject, "", self.fields, object)
    }
}

fn check_fields(
    subject: Subject,
    prefix: &str,
    fields: &[Field],
    object: &serde_json::Map<String, Value>,
) -> Result<(), ContractError> {
    for field in fields {
        let path = if prefix.is_empty() {
            field.name.to_string()
        } else {
            format!("{prefix}.{}", field.name)
        };

        match object.get(field.name) {
            None | Some(Value::Null) => {
                if field.required {
                    return Err(ContractError::MissingField {
                        subject,
                        field: path,
                    });
                }
            }
            Some(value) => check_value(subject, &path, field.kind, value)?,
        }
    }
    Ok(())
}

fn check_value(
    subject: Subject,
    path: &str,
    kind: FieldKind,
    value: &Value,
) -> Result<(), ContractError> {
    let valid = match (kind, value) {
        (FieldKind::String, Value::String(s)) => !s.is_empty(),
        (FieldKind::NonNegativeInteger, Value::Number(n)) => n.is_u64(),
        (FieldKind::Timestamp, Value::String(s)) => {
            chrono::DateTime::parse_from_rfc3339(s).is_ok()
        }
        (FieldKind::OneOf(allowed), Value::String(s)) => allowed.contains(&s.as_str()),
        (FieldKind::Object(fields), Value::Object(nested)) => {
            return check_fields(subject, path, fields, nested);
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(ContractError::InvalidField {
            subject,
            field: path.to_string(),
            expected: kind.describe(),
        })
    }
}

/// Wire values of `OrderStatus`.
pub const ORDER_STATUSES: &[&str] = &["created", "cancelled", "awaiting:payment", "complete"];

const TICKET_FIELDS: &[Field] = &[
    Field::required("id", FieldKind::String),
    Field::required("version", FieldKind::NonNegativeInteger),
    Field::required("title", FieldKind::String),
    Field::required("price", FieldKind::NonNegativeInteger),
    Field::required("userId", FieldKind::String),
    Field::optional("orderId", FieldKind::String),
];

static TICKET_CREATED: Schema = Schema {
    subject: Subject::TicketCreated,
    fields: TICKET_FIELDS,
};

static TICKET_UPDATED: Schema = Schema {
    subject: Subject::TicketUpdated,
    fields: TICKET_FIELDS,
};

const ORDER_TICKET_FIELDS: &[Field] = &[
    Field::required("id", FieldKind::String),
    Field::required("price", FieldKind::NonNegativeInteger),
];

const ORDER_CREATED_FIELDS: &[Field] = &[
    Field::required("id", FieldKind::String),
    Field::required("version", FieldKind::NonNegativeInteger),
    Field::required("status", FieldKind::OneOf(ORDER_STATUSES)),
    Field::required("userId", FieldKind::String),
    Field::required("expiresAt", FieldKind::Timestamp),
    Field::required("ticket", FieldKind::Object(ORDER_TICKET_FIELDS)),
];

const CANCELLED_TICKET_FIELDS: &[Field] = &[Field::required("id", FieldKind::String)];

const ORDER_CANCELLED_FIELDS: &[Field] = &[
    Field::required("id", FieldKind::String),
    Field::required("version", FieldKind::NonNegativeInteger),
    Field::required("ticket", FieldKind::Object(CANCELLED_TICKET_FIELDS)),
];

const EXPIRATION_COMPLETE_FIELDS: &[Field] = &[Field::required("orderId", FieldKind::String)];

const PAYMENT_CREATED_FIELDS: &[Field] = &[
    Field::required("id", FieldKind::String),
    Field::required("orderId", FieldKind::String),
    Field::required("stripeId", FieldKind::String),
];

static ORDER_CREATED: Schema = Schema {
    subject: Subject::OrderCreated,
    fields: ORDER_CREATED_FIELDS,
};

static ORDER_CANCELLED: Schema = Schema {
    subject: Subject::OrderCancelled,
    fields: ORDER_CANCELLED_FIELDS,
};

static EXPIRATION_COMPLETE: Schema = Schema {
    subject: Subject::ExpirationComplete,
    fields: EXPIRATION_COMPLETE_FIELDS,
};

static PAYMENT_CREATED: Schema = Schema {
    subject: Subject::PaymentCreated,
    fields: PAYMENT_CREATED_FIELDS,
};

/// Schema of a subject.
#[must_use]
pub const fn schema_for(subject: Subject) -> &'static Schema {
    match subject {
        Subject::TicketCreated => &TICKET_CREATED,
        Subject::TicketUpdated => &TICKET_UPDATED,
        Subject::OrderCreated => &ORDER_CREATED,
        Subject::OrderCancelled => &ORDER_CANCELLED,
        Subject::ExpirationComplete => &EXPIRATION_COMPLETE,
        Subject::PaymentCreated => &PAYMENT_CREATED,
    }
}

/// Schema of a subject given by wire name.
///
/// # Errors
///
/// Returns [`ContractError::UnknownSubject`] if `name` is outside the closed
/// enumeration.
pub fn schema_for_name(name: &str) -> Result<&'static Schema, ContractError> {
    name.parse::<Subject>().map(schema_for)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ticket() -> Value {
        json!({
            "id": "t-1",
            "version": 0,
            "title": "concert",
            "price": 20,
            "userId": "u-1"
        })
    }

    #[test]
    fn schema_lookup_is_exhaustive() {
        for subject in Subject::ALL {
            assert_eq!(schema_for(subject).subject, subject);
        }
    }

    #[test]
    fn valid_ticket_passes() {
        assert_eq!(schema_for(Subject::TicketCreated).validate(&ticket()), Ok(()));
    }

    #[test]
    fn optional_order_id_may_be_null() {
        let mut payload = ticket();
        payload["orderId"] = Value::Null;
        assert_eq!(schema_for(Subject::TicketUpdated).validate(&payload), Ok(()));
    }

    #[test]
    fn missing_field_is_reported_by_name() {
        let mut payload = ticket();
        if let Some(object) = payload.as_object_mut() {
            object.remove("userId");
        }

        let err = schema_for(Subject::TicketCreated).validate(&payload);
        assert_eq!(
            err,
            Err(ContractError::MissingField {
                subject: Subject::TicketCreated,
                field: "userId".to_string(),
            })
        );
    }

    #[test]
    fn negative_version_is_invalid() {
        let mut payload = ticket();
        payload["version"] = json!(-1);

        let err = schema_for(Subject::TicketUpdated).validate(&payload);
        assert!(matches!(err, Err(ContractError::InvalidField { ref field, .. }) if field == "version"));
    }

    #[test]
    fn nested_fields_are_checked_with_dotted_path() {
        let payload = json!({
            "id": "o-1",
            "version": 0,
            "status": "created",
            "userId": "u-1",
            "expiresAt": "2025-01-01T00:15:00Z",
            "ticket": { "id": "t-1" }
        });

        let err = schema_for(Subject::OrderCreated).validate(&payload);
        assert_eq!(
            err,
            Err(ContractError::MissingField {
                subject: Subject::OrderCreated,
                field: "ticket.price".to_string(),
            })
        );
    }

    #[test]
    fn status_must_be_enumerated() {
        let payload = json!({
            "id": "o-1",
            "version": 0,
            "status": "shipped",
            "userId": "u-1",
            "expiresAt": "2025-01-01T00:15:00Z",
            "ticket": { "id": "t-1", "price": 20 }
        });

        assert!(schema_for(Subject::OrderCreated).validate(&payload).is_err());
    }

    #[test]
    fn non_object_payload_is_malformed() {
        let err = schema_for(Subject::PaymentCreated).validate(&json!([1, 2, 3]));
        assert!(matches!(err, Err(ContractError::Malformed { .. })));
    }

    #[test]
    fn unknown_subject_name() {
        assert_eq!(
            schema_for_name("order:shipped").map(|s| s.subject),
            Err(ContractError::UnknownSubject("order:shipped".to_string()))
        );
    }
}
