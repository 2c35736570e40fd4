pub mod buf_ext;
pub mod counting_set;
pub mod random;
pub mod safe_cast;
