/// Commerce entities module
pub mod cart;
pub mod cart_item;
pub mod category;
pub mod coupon;
pub mod coupon_condition;
pub mod product_variant;

// Re-export entities
pub use cart::{Entity as Cart, Model as CartModel};
pub use cart_item::{Entity as CartItem, Model as CartItemModel};
pub use category::{Entity as Category, Model as CategoryModel};
pub use coupon::{DiscountType, Entity as Coupon, Model as CouponModel};
pub use coupon_condition::{
    ConditionKind, ConditionOperator, Entity as CouponConditionRow, Model as CouponConditionModel,
};
pub use product_variant::{Entity as ProductVariant, Model as ProductVariantModel};
