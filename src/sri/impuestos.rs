use crate::error::ErrorSri;
use crate::sri::xml::{DetalleFactura, ImpuestoTotal};

/// Redondeo a 2 decimales (mitad hacia arriba) para montos en dolares
pub fn redondear2(valor: f64) -> f64 {
    (valor * 100.0).round() / 100.0
}

/// Agrupa los detalles por (codigo, codigoPorcentaje) para `totalConImpuestos`.
///
/// Suma base imponible y valor de cada grupo. El orden de salida es el de la
/// primera aparicion de cada grupo. Todos los detalles de un grupo deben tener
/// la misma tarifa; si no, el grupo no tiene una tarifa representativa valida
/// y se retorna `Validacion`.
pub fn agrupar_impuestos(detalles: &[DetalleFactura]) -> Result<Vec<ImpuestoTotal>, ErrorSri> {
    let mut grupos: Vec<ImpuestoTotal> = Vec::new();

    for det in detalles {
        let existente = grupos.iter_mut().find(|g| {
            g.codigo == det.codigo_impuesto && g.codigo_porcentaje == det.codigo_porcentaje
        });

        match existente {
            Some(grupo) => {
                if (grupo.tarifa - det.tarifa).abs() > f64::EPSILON {
                    return Err(ErrorSri::Validacion(format!(
                        "Tarifas mezcladas en codigoPorcentaje {}: {:.2} y {:.2} ({})",
                        det.codigo_porcentaje, grupo.tarifa, det.tarifa, det.codigo_principal
                    )));
                }
                grupo.base_imponible += det.base_imponible;
                grupo.valor += det.valor;
            }
            None => grupos.push(ImpuestoTotal {
                codigo: det.codigo_impuesto.clone(),
                codigo_porcentaje: det.codigo_porcentaje.clone(),
                tarifa: det.tarifa,
                base_imponible: det.base_imponible,
                valor: det.valor,
            }),
        }
    }

    for grupo in &mut grupos {
        grupo.base_imponible = redondear2(grupo.base_imponible);
        grupo.valor = redondear2(grupo.valor);
    }

    Ok(grupos)
}

/// Suma de impuestos de todos los grupos
pub fn total_impuestos(grupos: &[ImpuestoTotal]) -> f64 {
    redondear2(grupos.iter().map(|g| g.valor).sum())
}
