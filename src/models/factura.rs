use crate::error::ErrorSri;
use crate::sri::clave_acceso::ClaveAcceso;
use crate::sri::impuestos::{agrupar_impuestos, redondear2, total_impuestos};
use crate::sri::xml::{tarifa_iva, DetalleFactura, PagoFactura, CODIGO_IVA};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Identificacion usada para consumidor final
pub const ID_CONSUMIDOR_FINAL: &str = "9999999999999";

/// Tolerancia para comparar montos ya redondeados a 2 decimales
const TOLERANCIA: f64 = 0.005;

/// Tipo de identificacion del comprador (tabla 6 de la ficha tecnica)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TipoIdentificacion {
    Ruc,
    Cedula,
    Pasaporte,
    ConsumidorFinal,
    Exterior,
}

impl TipoIdentificacion {
    pub fn codigo(&self) -> &'static str {
        match self {
            TipoIdentificacion::Ruc => "04",
            TipoIdentificacion::Cedula => "05",
            TipoIdentificacion::Pasaporte => "06",
            TipoIdentificacion::ConsumidorFinal => "07",
            TipoIdentificacion::Exterior => "08",
        }
    }
}

/// Mapea el tipo de identificacion del POS al del SRI
pub fn tipo_identificacion_sri(tipo_pos: &str) -> TipoIdentificacion {
    match tipo_pos {
        "RUC" => TipoIdentificacion::Ruc,
        "CEDULA" => TipoIdentificacion::Cedula,
        "PASAPORTE" => TipoIdentificacion::Pasaporte,
        "EXTERIOR" => TipoIdentificacion::Exterior,
        _ => TipoIdentificacion::ConsumidorFinal,
    }
}

/// Datos del comprador
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comprador {
    pub tipo_identificacion: TipoIdentificacion,
    pub identificacion: String,
    pub razon_social: String,
    pub direccion: Option<String>,
    pub email: Option<String>,
    pub telefono: Option<String>,
}

impl Comprador {
    pub fn consumidor_final() -> Self {
        Comprador {
            tipo_identificacion: TipoIdentificacion::ConsumidorFinal,
            identificacion: ID_CONSUMIDOR_FINAL.to_string(),
            razon_social: "CONSUMIDOR FINAL".to_string(),
            direccion: None,
            email: None,
            telefono: None,
        }
    }

    pub fn validar(&self) -> Result<(), ErrorSri> {
        let id = self.identificacion.trim();
        let longitud_ok = match self.tipo_identificacion {
            TipoIdentificacion::Ruc => id.len() == 13 && id.chars().all(|c| c.is_ascii_digit()),
            TipoIdentificacion::Cedula => id.len() == 10 && id.chars().all(|c| c.is_ascii_digit()),
            TipoIdentificacion::ConsumidorFinal => id == ID_CONSUMIDOR_FINAL,
            TipoIdentificacion::Pasaporte | TipoIdentificacion::Exterior => {
                !id.is_empty() && id.len() <= 20
            }
        };
        if !longitud_ok {
            return Err(ErrorSri::Validacion(format!(
                "Identificacion '{}' invalida para tipo {}",
                id,
                self.tipo_identificacion.codigo()
            )));
        }
        if self.razon_social.trim().is_empty() {
            return Err(ErrorSri::Validacion("El comprador no tiene nombre".to_string()));
        }
        Ok(())
    }
}

/// Totales calculados por el modulo de ventas
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Totales {
    pub total_sin_impuestos: f64,
    pub total_descuento: f64,
    pub propina: f64,
    pub importe_total: f64,
}

/// Factura lista para emitir. El secuencial lo asigna el contador.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BorradorFactura {
    pub fecha_emision: NaiveDate,
    pub comprador: Comprador,
    pub detalles: Vec<DetalleFactura>,
    pub pagos: Vec<PagoFactura>,
    pub totales: Totales,
}

impl BorradorFactura {
    /// Valida coherencia interna antes de generar la clave de acceso.
    ///
    /// - cada detalle: precio total = cantidad * precio - descuento, valor = base * tarifa
    /// - total sin impuestos = suma de bases
    /// - importe total = total sin impuestos + impuestos + propina
    /// - suma de pagos = importe total
    pub fn validar(&self) -> Result<(), ErrorSri> {
        self.comprador.validar()?;
        validar_detalles(&self.detalles)?;

        let suma_bases = redondear2(self.detalles.iter().map(|d| d.precio_total_sin_impuesto).sum());
        if !iguales(suma_bases, self.totales.total_sin_impuestos) {
            return Err(ErrorSri::Validacion(format!(
                "totalSinImpuestos {:.2} no coincide con la suma de detalles {:.2}",
                self.totales.total_sin_impuestos, suma_bases
            )));
        }

        if self.totales.propina < 0.0 || self.totales.total_descuento < 0.0 {
            return Err(ErrorSri::Validacion("Propina y descuento no pueden ser negativos".to_string()));
        }

        let impuestos = agrupar_impuestos(&self.detalles)?;
        let esperado = redondear2(
            self.totales.total_sin_impuestos + total_impuestos(&impuestos) + self.totales.propina,
        );
        if !iguales(esperado, self.totales.importe_total) {
            return Err(ErrorSri::Validacion(format!(
                "importeTotal {:.2} no coincide con base + impuestos + propina = {:.2}",
                self.totales.importe_total, esperado
            )));
        }

        if self.pagos.is_empty() {
            return Err(ErrorSri::Validacion("La factura no tiene formas de pago".to_string()));
        }
        let suma_pagos = redondear2(self.pagos.iter().map(|p| p.total).sum());
        if !iguales(suma_pagos, self.totales.importe_total) {
            return Err(ErrorSri::Validacion(format!(
                "La suma de pagos {:.2} no coincide con el importe total {:.2}",
                suma_pagos, self.totales.importe_total
            )));
        }
        Ok(())
    }
}

/// Nota de credito que revierte total o parcialmente una factura autorizada.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BorradorNotaCredito {
    pub fecha_emision: NaiveDate,
    pub factura: ClaveAcceso,
    pub comprador: Comprador,
    pub motivo: String,
    pub detalles: Vec<DetalleFactura>,
}

impl BorradorNotaCredito {
    pub fn validar(&self) -> Result<(), ErrorSri> {
        self.comprador.validar()?;
        validar_detalles(&self.detalles)?;
        if self.motivo.trim().is_empty() {
            return Err(ErrorSri::Validacion("La nota de credito requiere un motivo".to_string()));
        }
        Ok(())
    }

    pub fn total_sin_impuestos(&self) -> f64 {
        redondear2(self.detalles.iter().map(|d| d.precio_total_sin_impuesto).sum())
    }

    /// valorModificacion: base + impuestos de los detalles devueltos
    pub fn valor_modificacion(&self) -> Result<f64, ErrorSri> {
        let impuestos = agrupar_impuestos(&self.detalles)?;
        Ok(redondear2(self.total_sin_impuestos() + total_impuestos(&impuestos)))
    }
}

fn validar_detalles(detalles: &[DetalleFactura]) -> Result<(), ErrorSri> {
    if detalles.is_empty() {
        return Err(ErrorSri::Validacion("El comprobante no tiene detalles".to_string()));
    }
    for (i, det) in detalles.iter().enumerate() {
        if det.cantidad <= 0.0 || det.precio_unitario < 0.0 || det.descuento < 0.0 {
            return Err(ErrorSri::Validacion(format!(
                "Detalle {} ({}): cantidad, precio o descuento invalidos",
                i + 1,
                det.codigo_principal
            )));
        }
        let esperado = redondear2(det.cantidad * det.precio_unitario - det.descuento);
        if !iguales(esperado, det.precio_total_sin_impuesto) {
            return Err(ErrorSri::Validacion(format!(
                "Detalle {} ({}): precioTotalSinImpuesto {:.2} deberia ser {:.2}",
                i + 1,
                det.codigo_principal,
                det.precio_total_sin_impuesto,
                esperado
            )));
        }
        if det.codigo_impuesto == CODIGO_IVA {
            let tarifa = tarifa_iva(&det.codigo_porcentaje)?;
            if !iguales(tarifa, det.tarifa) {
                return Err(ErrorSri::Validacion(format!(
                    "Detalle {} ({}): tarifa {:.2} no corresponde al codigoPorcentaje {}",
                    i + 1,
                    det.codigo_principal,
                    det.tarifa,
                    det.codigo_porcentaje
                )));
            }
        }
        let iva = redondear2(det.base_imponible * det.tarifa / 100.0);
        if !iguales(iva, det.valor) {
            return Err(ErrorSri::Validacion(format!(
                "Detalle {} ({}): valor de impuesto {:.2} deberia ser {:.2}",
                i + 1,
                det.codigo_principal,
                det.valor,
                iva
            )));
        }
    }
    Ok(())
}

fn iguales(a: f64, b: f64) -> bool {
    (a - b).abs() < TOLERANCIA
}
