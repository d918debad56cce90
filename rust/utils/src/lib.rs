pub mod pem;
pub mod reference;
