use crate::error::ErrorSri;
use crate::sri::clave_acceso::ClaveAcceso;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tipos de comprobante soportados
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TipoComprobante {
    Factura,
    NotaCredito,
}

impl TipoComprobante {
    /// codDoc del SRI
    pub fn codigo(&self) -> &'static str {
        match self {
            TipoComprobante::Factura => "01",
            TipoComprobante::NotaCredito => "04",
        }
    }

    /// Tag raiz del XML
    pub fn tag_raiz(&self) -> &'static str {
        match self {
            TipoComprobante::Factura => "factura",
            TipoComprobante::NotaCredito => "notaCredito",
        }
    }

    pub fn desde_codigo(codigo: &str) -> Result<Self, ErrorSri> {
        match codigo {
            "01" => Ok(TipoComprobante::Factura),
            "04" => Ok(TipoComprobante::NotaCredito),
            otro => Err(ErrorSri::Validacion(format!(
                "Tipo de comprobante no soportado: '{}'",
                otro
            ))),
        }
    }
}

/// Estados del ciclo de vida de un comprobante electronico.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EstadoComprobante {
    Borrador,
    XmlGenerado,
    Firmado,
    Enviado,
    Recibido,
    Devuelto,
    Autorizado,
    NoAutorizado,
    Anulado,
}

impl EstadoComprobante {
    pub fn as_str(&self) -> &'static str {
        match self {
            EstadoComprobante::Borrador => "BORRADOR",
            EstadoComprobante::XmlGenerado => "XML_GENERADO",
            EstadoComprobante::Firmado => "FIRMADO",
            EstadoComprobante::Enviado => "ENVIADO",
            EstadoComprobante::Recibido => "RECIBIDO",
            EstadoComprobante::Devuelto => "DEVUELTO",
            EstadoComprobante::Autorizado => "AUTORIZADO",
            EstadoComprobante::NoAutorizado => "NO_AUTORIZADO",
            EstadoComprobante::Anulado => "ANULADO",
        }
    }

    /// Estados donde la clave de acceso ya no admite mas transiciones
    /// (Autorizado solo puede pasar a Anulado con una nota de credito).
    pub fn es_terminal(&self) -> bool {
        matches!(
            self,
            EstadoComprobante::Devuelto | EstadoComprobante::NoAutorizado | EstadoComprobante::Anulado
        )
    }
}

impl fmt::Display for EstadoComprobante {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EstadoComprobante {
    type Err = ErrorSri;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "BORRADOR" => EstadoComprobante::Borrador,
            "XML_GENERADO" => EstadoComprobante::XmlGenerado,
            "FIRMADO" => EstadoComprobante::Firmado,
            "ENVIADO" => EstadoComprobante::Enviado,
            "RECIBIDO" => EstadoComprobante::Recibido,
            "DEVUELTO" => EstadoComprobante::Devuelto,
            "AUTORIZADO" => EstadoComprobante::Autorizado,
            "NO_AUTORIZADO" => EstadoComprobante::NoAutorizado,
            "ANULADO" => EstadoComprobante::Anulado,
            otro => {
                return Err(ErrorSri::Validacion(format!(
                    "Estado de comprobante desconocido: '{}'",
                    otro
                )))
            }
        })
    }
}

/// Comprobante persistido con su estado actual.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comprobante {
    pub id: i64,
    pub tenant: String,
    pub tipo: TipoComprobante,
    pub clave_acceso: ClaveAcceso,
    /// estab-ptoEmi-secuencial, ej: 001-001-000000001
    pub numero: String,
    pub fecha_emision: NaiveDate,
    pub estado: EstadoComprobante,
    pub importe_total: f64,
    pub xml: Option<String>,
    pub xml_firmado: Option<String>,
    pub numero_autorizacion: Option<String>,
    pub fecha_autorizacion: Option<String>,
    /// Para notas de credito: clave de la factura modificada
    pub documento_modificado: Option<ClaveAcceso>,
}

/// Registro inmutable de un cambio de estado.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transicion {
    pub comprobante_id: i64,
    pub desde: Option<EstadoComprobante>,
    pub hacia: EstadoComprobante,
    pub fecha: DateTime<Utc>,
    pub detalle: Option<String>,
}

/// Numero de documento visible: estab-ptoEmi-secuencial
pub fn numero_documento(establecimiento: &str, punto_emision: &str, secuencial: u64) -> String {
    format!("{}-{}-{:09}", establecimiento, punto_emision, secuencial)
}
