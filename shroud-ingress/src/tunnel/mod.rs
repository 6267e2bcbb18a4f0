pub mod dial;
pub mod relay;

pub use relay::ProxyKind;
