pub mod certificado;
pub mod clave_acceso;
pub mod firma;
pub mod impuestos;
pub mod respuesta;
pub mod soap;
pub mod xml;
