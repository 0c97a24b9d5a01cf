// Payment fulfillment: Stripe intake, the once-only gate, and checkout side effects.

pub mod checkout;
pub mod fulfillment;
pub mod handlers;
pub mod stripe;
