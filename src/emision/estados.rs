//! Maquina de estados del comprobante electronico.
//!
//! ```text
//! BORRADOR -> XML_GENERADO -> FIRMADO -> ENVIADO -> RECIBIDO -> AUTORIZADO -> ANULADO
//!                                          |           |
//!                                          v           v
//!                                      DEVUELTO   NO_AUTORIZADO
//! ```
//!
//! ANULADO solo se alcanza con una nota de credito autorizada por el valor
//! total de la factura (`EvidenciaAnulacion`).
use crate::error::ErrorSri;
use crate::models::{Comprobante, EstadoComprobante, TipoComprobante};
use crate::sri::clave_acceso::ClaveAcceso;

/// Diferencia maxima entre valorModificacion y el total de la factura
const TOLERANCIA_ANULACION: f64 = 0.005;

impl EstadoComprobante {
    /// Transiciones permitidas por `aplicar`. ANULADO queda fuera: solo `anular`.
    pub fn puede_transicionar(&self, hacia: EstadoComprobante) -> bool {
        use EstadoComprobante::*;
        matches!(
            (self, hacia),
            (Borrador, XmlGenerado)
                | (XmlGenerado, Firmado)
                | (Firmado, Enviado)
                | (Enviado, Recibido)
                | (Enviado, Devuelto)
                | (Recibido, Autorizado)
                | (Recibido, NoAutorizado)
        )
    }
}

/// Prueba de que una factura puede anularse: nota de credito autorizada que
/// la referencia por su valor total.
#[derive(Debug, Clone, PartialEq)]
pub struct EvidenciaAnulacion {
    pub clave_nota_credito: String,
    pub numero_autorizacion: String,
}

impl EvidenciaAnulacion {
    pub fn desde_nota_credito(nota: &Comprobante, factura: &Comprobante) -> Result<Self, ErrorSri> {
        let invalida = || ErrorSri::TransicionInvalida {
            desde: factura.estado.to_string(),
            hacia: EstadoComprobante::Anulado.to_string(),
        };

        if nota.tipo != TipoComprobante::NotaCredito || factura.tipo != TipoComprobante::Factura {
            return Err(invalida());
        }
        if nota.estado != EstadoComprobante::Autorizado {
            return Err(invalida());
        }
        if nota.documento_modificado.as_ref() != Some(&factura.clave_acceso) {
            return Err(invalida());
        }
        if (nota.importe_total - factura.importe_total).abs() > TOLERANCIA_ANULACION {
            return Err(ErrorSri::Validacion(format!(
                "La nota de credito ({:.2}) no cubre el total de la factura ({:.2})",
                nota.importe_total, factura.importe_total
            )));
        }

        let numero_autorizacion = nota
            .numero_autorizacion
            .clone()
            .unwrap_or_else(|| nota.clave_acceso.to_string());

        Ok(EvidenciaAnulacion {
            clave_nota_credito: nota.clave_acceso.to_string(),
            numero_autorizacion,
        })
    }
}

/// Estado actual de un comprobante con las reglas de avance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaquinaEstados {
    estado: EstadoComprobante,
}

impl MaquinaEstados {
    pub fn nueva() -> Self {
        MaquinaEstados {
            estado: EstadoComprobante::Borrador,
        }
    }

    pub fn desde(estado: EstadoComprobante) -> Self {
        MaquinaEstados { estado }
    }

    pub fn estado(&self) -> EstadoComprobante {
        self.estado
    }

    /// Avanza un paso. Retorna el estado anterior.
    pub fn aplicar(&mut self, hacia: EstadoComprobante) -> Result<EstadoComprobante, ErrorSri> {
        if !self.estado.puede_transicionar(hacia) {
            return Err(ErrorSri::TransicionInvalida {
                desde: self.estado.to_string(),
                hacia: hacia.to_string(),
            });
        }
        let anterior = self.estado;
        self.estado = hacia;
        Ok(anterior)
    }

    /// AUTORIZADO -> ANULADO con la evidencia de la nota de credito.
    /// La evidencia debe nombrar una nota de credito (codDoc 04) con su
    /// numero de autorizacion.
    pub fn anular(&mut self, evidencia: &EvidenciaAnulacion) -> Result<EstadoComprobante, ErrorSri> {
        if self.estado != EstadoComprobante::Autorizado {
            return Err(ErrorSri::TransicionInvalida {
                desde: self.estado.to_string(),
                hacia: EstadoComprobante::Anulado.to_string(),
            });
        }
        let clave = evidencia.clave_nota_credito.parse::<ClaveAcceso>()?;
        if clave.cod_doc() != TipoComprobante::NotaCredito.codigo() {
            return Err(ErrorSri::Validacion(format!(
                "La clave {} no es de una nota de credito",
                clave
            )));
        }
        if evidencia.numero_autorizacion.trim().is_empty() {
            return Err(ErrorSri::Validacion(
                "La nota de credito no tiene numero de autorizacion".to_string(),
            ));
        }
        let anterior = self.estado;
        self.estado = EstadoComprobante::Anulado;
        Ok(anterior)
    }
}

impl Default for MaquinaEstados {
    fn default() -> Self {
        Self::nueva()
    }
}
