/// Commerce API handlers module
pub mod carts;
pub mod coupons;

// Re-export route builders
pub use carts::carts_routes;
pub use coupons::coupons_routes;
