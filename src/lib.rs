//! Facturacion electronica del SRI (Ecuador).
//!
//! Genera la clave de acceso y el XML del comprobante, lo firma con XAdES-BES
//! usando la firma electronica (.p12) del emisor, lo envia a los web services
//! de recepcion y autorizacion, y lleva el ciclo de vida en SQLite.
pub mod config;
pub mod db;
pub mod emision;
pub mod error;
pub mod logs;
pub mod models;
pub mod sri;

pub use config::{Ambiente, ConfigSri, IdentidadFiscal};
pub use db::Database;
pub use emision::{canal, CredencialFirma, Orquestador, ResultadoEmision, SenalCancelacion};
pub use error::ErrorSri;
pub use sri::soap::{ClienteAutoridad, ClienteSoap};
