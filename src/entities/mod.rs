pub mod order;
pub mod order_item;
pub mod owned_product;
pub mod product;
pub mod review;
