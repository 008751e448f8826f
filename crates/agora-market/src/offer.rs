//! Supplier offers made against requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MarketError;

/// One way of paying for an offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentOption {
    /// Option identifier, referenced when the deal is settled.
    pub id: String,
    /// Price in the asset's base units, as a decimal string.
    pub price: String,
    /// Settlement asset (token address or symbol).
    pub asset: String,
}

/// Cancellation terms: cancelling before `time` costs `penalty` percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOption {
    /// Unix timestamp (seconds) the penalty applies until.
    pub time: i64,
    /// Penalty in percent of the price.
    pub penalty: u32,
}

/// An offer received against a request. Never mutated after receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferRecord {
    /// Unique offer identifier.
    pub id: String,
    /// The request this offer answers.
    pub request_id: String,
    /// Application-defined offer terms.
    pub options: Value,
    /// Accepted payment options.
    pub payment: Vec<PaymentOption>,
    /// Cancellation schedule.
    pub cancel: Vec<CancelOption>,
    /// Unix timestamp (seconds) at which the offer expires.
    pub expire: i64,
    /// Supplier signature over the offer, verified outside this crate.
    pub signature: String,
}

impl OfferRecord {
    /// Checks the structural invariants.
    ///
    /// # Errors
    ///
    /// Returns [`MarketError::InvalidOffer`] if the id or request id is empty, or
    /// no payment option is present.
    pub fn validate(&self) -> Result<(), MarketError> {
        if self.id.trim().is_empty() {
            return Err(MarketError::InvalidOffer("offer id is empty".to_string()));
        }
        if self.request_id.trim().is_empty() {
            return Err(MarketError::InvalidOffer(format!(
                "offer {} does not reference a request",
                self.id
            )));
        }
        if self.payment.is_empty() {
            return Err(MarketError::InvalidOffer(format!(
                "offer {} has no payment options",
                self.id
            )));
        }
        Ok(())
    }

    /// An offer whose expiry is at or before `now_secs` is expired.
    #[must_use]
    pub const fn is_expired(&self, now_secs: i64) -> bool {
        self.expire <= now_secs
    }

    /// Decodes and validates a gossiped offer.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid offer.
    pub fn decode(bytes: &[u8]) -> Result<Self, MarketError> {
        let offer: Self = serde_json::from_slice(bytes)?;
        offer.validate()?;
        Ok(offer)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn offer(id: &str, request_id: &str, expire: i64) -> OfferRecord {
        OfferRecord {
            id: id.to_string(),
            request_id: request_id.to_string(),
            options: json!({"room": "double"}),
            payment: vec![PaymentOption {
                id: "pay-1".to_string(),
                price: "1000000000000000000".to_string(),
                asset: "0xstable".to_string(),
            }],
            cancel: vec![CancelOption {
                time: expire - 10,
                penalty: 50,
            }],
            expire,
            signature: "0xsig".to_string(),
        }
    }

    #[test]
    fn valid_offer_passes() {
        assert!(offer("o1", "r1", 100).validate().is_ok());
    }

    #[test]
    fn offer_without_request_is_invalid() {
        assert!(matches!(
            offer("o1", " ", 100).validate(),
            Err(MarketError::InvalidOffer(_))
        ));
    }

    #[test]
    fn offer_without_payment_is_invalid() {
        let mut o = offer("o1", "r1", 100);
        o.payment.clear();
        assert!(o.validate().is_err());
    }

    #[test]
    fn decode_round_trips_wire_form() {
        let o = offer("o1", "r1", 100);
        let bytes = serde_json::to_vec(&o).expect("encode");
        assert_eq!(OfferRecord::decode(&bytes).expect("decode"), o);
        assert!(o.is_expired(100));
        assert!(!o.is_expired(99));
    }
}
