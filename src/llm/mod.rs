//! Language-model seam.

pub mod model;
