use crate::sri::respuesta::MensajeSri;
use thiserror::Error;

/// Errores del flujo de facturacion electronica.
///
/// Configuracion, Certificado y Cripto fallan antes de cualquier transicion.
/// Red se puede reintentar con la misma clave de acceso. RechazoSri es
/// terminal para la clave: corregir exige un comprobante nuevo.
#[derive(Debug, Error)]
pub enum ErrorSri {
    #[error("Configuracion invalida: {0}")]
    Configuracion(String),

    #[error("Certificado invalido: {0}")]
    Certificado(String),

    #[error("Error en firma digital: {0}")]
    Cripto(String),

    #[error("Datos del comprobante invalidos: {0}")]
    Validacion(String),

    #[error("Error de red con el SRI: {0}")]
    Red(String),

    #[error("Respuesta inesperada del SRI: {0}")]
    Protocolo(String),

    #[error("Comprobante {estado} por el SRI: {}", resumir_mensajes(.mensajes))]
    RechazoSri {
        estado: String,
        mensajes: Vec<MensajeSri>,
    },

    #[error("Transicion invalida de {desde} a {hacia}")]
    TransicionInvalida { desde: String, hacia: String },

    #[error("Error de base de datos: {0}")]
    Persistencia(#[from] rusqlite::Error),

    #[error("Operacion cancelada: {0}")]
    Cancelado(String),
}

impl ErrorSri {
    /// Indica si el llamador puede reintentar sin generar una nueva clave de acceso.
    pub fn es_reintentable(&self) -> bool {
        matches!(self, ErrorSri::Red(_) | ErrorSri::Cancelado(_))
    }
}

impl From<reqwest::Error> for ErrorSri {
    fn from(e: reqwest::Error) -> Self {
        ErrorSri::Red(e.to_string())
    }
}

fn resumir_mensajes(mensajes: &[MensajeSri]) -> String {
    if mensajes.is_empty() {
        return "sin mensajes".to_string();
    }
    mensajes
        .iter()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join(" | ")
}
