// Pricing, cart and checkout
pub mod commerce;

// Stock bookkeeping shared by placement and cancellation
pub mod inventory;

// Order lifecycle
pub mod orders;

// Gateway-confirmed payments
pub mod payment_gateway;
pub mod payments;

// Post-delivery refund requests
pub mod refunds;
