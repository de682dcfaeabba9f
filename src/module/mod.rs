pub mod conv_pool;
pub mod dense;
