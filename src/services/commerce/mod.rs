/// Commerce services module - cart pricing, coupons and checkout
pub mod cart_service;
pub mod checkout_service;
pub mod coupon_service;
pub mod coupon_validator;

// Re-export services for convenience
pub use cart_service::{AddToCartInput, CartService, CartView};
pub use checkout_service::CheckoutService;
pub use coupon_service::{CouponService, CreateCouponInput};
