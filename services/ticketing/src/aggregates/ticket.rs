//! Ticket aggregate and the orders service's copy of it.

use super::versioned;
use crate::error::DomainError;
use serde::{Deserialize, Serialize};
use ticketbus_core::events::{TicketCreated, TicketUpdated};

/// A ticket for sale, owned by the tickets service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// Ticket id
    pub id: String,
    /// Version, bumped on every write
    pub version: u64,
    /// Title
    pub title: String,
    /// Price in minor currency units
    pub price: u64,
    /// Seller
    pub user_id: String,
    /// Order currently holding the ticket
    pub order_id: Option<String>,
}

versioned!(Ticket, "ticket");

impl Ticket {
    /// A fresh, unreserved ticket at version 0.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::Invalid`] for an empty title or a zero price.
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        title: impl Into<String>,
        price: u64,
    ) -> Result<Self, DomainError> {
        let title = title.into();
        validate(&title, price)?;
        Ok(Self {
            id: id.into(),
            version: 0,
            title,
            price,
            user_id: user_id.into(),
            order_id: None,
        })
    }

    /// Whether an order holds the ticket.
    #[must_use]
    pub const fn is_reserved(&self) -> bool {
        self.order_id.is_some()
    }

    /// Change title and price on behalf of `user_id`.
    ///
    /// # Errors
    ///
    /// - [`DomainError::NotOwner`] if `user_id` is not the seller
    /// - [`DomainError::Reserved`] while an order holds the ticket
    /// - [`DomainError::Invalid`] for an empty title or a zero price
    pub fn edit(&mut self, user_id: &str, title: &str, price: u64) -> Result<(), DomainError> {
        if self.user_id != user_id {
            return Err(DomainError::NotOwner);
        }
        if self.is_reserved() {
            return Err(DomainError::Reserved(self.id.clone()));
        }
        validate(title, price)?;
        self.title = title.to_string();
        self.price = price;
        Ok(())
    }

    /// Hold the ticket for `order_id`.
    ///
    /// Returns `false` if that order already holds it.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::Reserved`] if another order holds it.
    pub fn reserve(&mut self, order_id: &str) -> Result<bool, DomainError> {
        match self.order_id.as_deref() {
            Some(current) if current == order_id => Ok(false),
            Some(_) => Err(DomainError::Reserved(self.id.clone())),
            None => {
                self.order_id = Some(order_id.to_string());
                Ok(true)
            }
        }
    }

    /// Release the hold of `order_id`. Returns `false` if it held nothing.
    pub fn release(&mut self, order_id: &str) -> bool {
        if self.order_id.as_deref() == Some(order_id) {
            self.order_id = None;
            true
        } else {
            false
        }
    }

    /// `ticket:created` payload.
    #[must_use]
    pub fn created_event(&self) -> TicketCreated {
        TicketCreated {
            id: self.id.clone(),
            version: self.version,
            title: self.title.clone(),
            price: self.price,
            user_id: self.user_id.clone(),
        }
    }

    /// `ticket:updated` payload for the current state.
    #[must_use]
    pub fn updated_event(&self) -> TicketUpdated {
        TicketUpdated {
            id: self.id.clone(),
            version: self.version,
            title: self.title.clone(),
            price: self.price,
            user_id: self.user_id.clone(),
            order_id: self.order_id.clone(),
        }
    }
}

fn validate(title: &str, price: u64) -> Result<(), DomainError> {
    if title.trim().is_empty() {
        return Err(DomainError::Invalid("title is required".to_string()));
    }
    if price == 0 {
        return Err(DomainError::Invalid("price must be greater than 0".to_string()));
    }
    Ok(())
}

/// The orders service's copy of a ticket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketReplica {
    /// Ticket id
    pub id: String,
    /// Mirrors the owner's version
    pub version: u64,
    /// Title
    pub title: String,
    /// Price in minor currency units
    pub price: u64,
}

versioned!(TicketReplica, "ticket-replica");

impl From<&TicketCreated> for TicketReplica {
    fn from(event: &TicketCreated) -> Self {
        Self {
            id: event.id.clone(),
            version: event.version,
            title: event.title.clone(),
            price: event.price,
        }
    }
}

impl TicketReplica {
    /// Copy the fields carried by `ticket:updated`.
    pub fn apply_update(&mut self, event: &TicketUpdated) {
        self.title.clone_from(&event.title);
        self.price = event.price;
    }
}
