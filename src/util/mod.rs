pub mod hash;
pub mod stop;
