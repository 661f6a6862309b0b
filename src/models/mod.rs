pub mod comprobante;
pub mod factura;

pub use comprobante::*;
pub use factura::*;
