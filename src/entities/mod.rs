pub mod commerce;
pub mod order;
pub mod order_item;
pub mod payment;
pub mod product;
pub mod refund_request;
pub mod user;

pub use order::{
    Entity as Order, Model as OrderModel, OrderStatus, PaymentMethod, PaymentStatus,
};
pub use order_item::{Entity as OrderItem, Model as OrderItemModel};
pub use payment::{Entity as Payment, Model as PaymentModel, PaymentRecordStatus};
pub use product::{Entity as Product, Model as ProductModel};
pub use refund_request::{Entity as RefundRequest, Model as RefundRequestModel, RefundStatus};
pub use user::{Entity as User, Model as UserModel, UserRole};
