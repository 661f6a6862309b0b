use crate::config::IdentidadFiscal;
use crate::error::ErrorSri;
use crate::models::{Comprador, Totales, TipoComprobante};
use crate::sri::clave_acceso::{ClaveAcceso, EMISION_NORMAL};
use crate::sri::impuestos::redondear2;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Codigo de impuesto IVA
pub const CODIGO_IVA: &str = "2";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ImpuestoTotal {
    pub codigo: String,            // "2" = IVA
    pub codigo_porcentaje: String, // "0"=0%, "4"=15%, etc
    /// Tarifa representativa del grupo (no se emite en totalImpuesto)
    pub tarifa: f64,
    pub base_imponible: f64,
    pub valor: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PagoFactura {
    pub forma_pago: String, // "01"=efectivo, "20"=otros
    pub total: f64,
}

impl PagoFactura {
    pub fn nuevo(forma_pago: &str, total: f64) -> Self {
        PagoFactura {
            forma_pago: forma_pago.to_string(),
            total,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DetalleFactura {
    pub codigo_principal: String,
    pub descripcion: String,
    pub cantidad: f64,
    pub precio_unitario: f64,
    pub descuento: f64,
    pub precio_total_sin_impuesto: f64,
    pub codigo_impuesto: String,
    pub codigo_porcentaje: String,
    pub tarifa: f64,
    pub base_imponible: f64,
    pub valor: f64,
}

impl DetalleFactura {
    /// Detalle gravado con IVA; calcula base y valor redondeados a 2 decimales.
    pub fn nuevo(
        codigo: &str,
        descripcion: &str,
        cantidad: f64,
        precio_unitario: f64,
        descuento: f64,
        codigo_porcentaje: &str,
    ) -> Result<Self, ErrorSri> {
        let precio_total = redondear2(cantidad * precio_unitario - descuento);
        let tarifa = tarifa_iva(codigo_porcentaje)?;
        Ok(DetalleFactura {
            codigo_principal: codigo.to_string(),
            descripcion: descripcion.to_string(),
            cantidad,
            precio_unitario,
            descuento,
            precio_total_sin_impuesto: precio_total,
            codigo_impuesto: CODIGO_IVA.to_string(),
            codigo_porcentaje: codigo_porcentaje.to_string(),
            tarifa,
            base_imponible: precio_total,
            valor: redondear2(precio_total * tarifa / 100.0),
        })
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CampoAdicional {
    pub nombre: String,
    pub valor: String,
}

/// Documento que sustenta una nota de credito
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SustentoNotaCredito {
    pub cod_doc_modificado: String,       // "01" factura
    pub num_doc_modificado: String,       // "001-001-000000001"
    pub fecha_emision_doc_sustento: NaiveDate,
    pub motivo: String,
}

/// Codigos de porcentaje IVA del SRI
pub fn tarifa_iva(codigo: &str) -> Result<f64, ErrorSri> {
    let tarifa = match codigo {
        "0" => 0.0,
        "2" => 12.0,
        "3" => 14.0,
        "4" => 15.0,
        "5" => 5.0,
        "6" => 0.0, // no objeto de impuesto
        "7" => 0.0, // exento
        "8" => 8.0, // tarifa especial turismo
        _ => {
            return Err(ErrorSri::Validacion(format!(
                "codigoPorcentaje de IVA desconocido: '{}'",
                codigo
            )))
        }
    };
    Ok(tarifa)
}

/// Mapea forma de pago POS a codigo SRI
pub fn forma_pago_sri(forma_pos: &str) -> &'static str {
    match forma_pos {
        "EFECTIVO" => "01",
        "TRANSFERENCIA" => "20",
        "TARJETA" => "19",
        _ => "01",
    }
}

/// Genera el XML de factura electronica SRI v2.0.0
///
/// La fecha de emision y el secuencial salen de la clave de acceso, asi el XML
/// nunca contradice la clave. Para la misma entrada produce los mismos bytes.
///
/// IMPORTANTE: No usa self-closing tags (<tag/>) porque el SRI los rechaza.
/// Todos los tags usan formato <tag></tag>.
pub fn generar_xml_factura(
    identidad: &IdentidadFiscal,
    clave: &ClaveAcceso,
    comprador: &Comprador,
    detalles: &[DetalleFactura],
    impuestos_totales: &[ImpuestoTotal],
    totales: &Totales,
    pagos: &[PagoFactura],
) -> Result<String, ErrorSri> {
    verificar_clave(identidad, clave, TipoComprobante::Factura)?;
    let mut xml = String::with_capacity(8192);

    abrir_raiz(&mut xml, TipoComprobante::Factura, "2.0.0");

    info_tributaria(&mut xml, identidad, clave, TipoComprobante::Factura);

    // === infoFactura ===
    xml.push_str("  <infoFactura>\n");
    xml_tag(&mut xml, 4, "fechaEmision", &fecha_sri(clave.fecha_emision()));
    xml_tag(&mut xml, 4, "dirEstablecimiento", &xml_escape(&identidad.dir_establecimiento));
    if let Some(ref especial) = identidad.contribuyente_especial {
        xml_tag(&mut xml, 4, "contribuyenteEspecial", &xml_escape(especial));
    }
    xml_tag(&mut xml, 4, "obligadoContabilidad", identidad.obligado_contabilidad_sri());
    xml_tag(&mut xml, 4, "tipoIdentificacionComprador", comprador.tipo_identificacion.codigo());
    xml_tag(&mut xml, 4, "razonSocialComprador", &xml_escape(&comprador.razon_social));
    xml_tag(&mut xml, 4, "identificacionComprador", &xml_escape(&comprador.identificacion));

    if let Some(ref dir) = comprador.direccion {
        if !dir.trim().is_empty() {
            xml_tag(&mut xml, 4, "direccionComprador", &xml_escape(dir));
        }
    }

    xml_tag(&mut xml, 4, "totalSinImpuestos", &monto(totales.total_sin_impuestos));
    xml_tag(&mut xml, 4, "totalDescuento", &monto(totales.total_descuento));

    total_con_impuestos(&mut xml, impuestos_totales);

    xml_tag(&mut xml, 4, "propina", &monto(totales.propina));
    xml_tag(&mut xml, 4, "importeTotal", &monto(totales.importe_total));
    xml_tag(&mut xml, 4, "moneda", "DOLAR");

    // pagos
    xml.push_str("    <pagos>\n");
    for pago in pagos {
        xml.push_str("      <pago>\n");
        xml_tag(&mut xml, 8, "formaPago", &pago.forma_pago);
        xml_tag(&mut xml, 8, "total", &monto(pago.total));
        xml.push_str("      </pago>\n");
    }
    xml.push_str("    </pagos>\n");

    xml.push_str("  </infoFactura>\n");

    detalles_xml(&mut xml, detalles, "codigoPrincipal");
    info_adicional(&mut xml, &campos_adicionales(comprador));

    cerrar_raiz(&mut xml, TipoComprobante::Factura);
    Ok(xml)
}

/// Genera XML de nota de credito electrónica SRI v1.1.0
pub fn generar_xml_nota_credito(
    identidad: &IdentidadFiscal,
    clave: &ClaveAcceso,
    comprador: &Comprador,
    detalles: &[DetalleFactura],
    impuestos_totales: &[ImpuestoTotal],
    totales: &Totales,
    sustento: &SustentoNotaCredito,
) -> Result<String, ErrorSri> {
    verificar_clave(identidad, clave, TipoComprobante::NotaCredito)?;
    let mut xml = String::with_capacity(8192);

    abrir_raiz(&mut xml, TipoComprobante::NotaCredito, "1.1.0");

    info_tributaria(&mut xml, identidad, clave, TipoComprobante::NotaCredito);

    // === infoNotaCredito ===
    xml.push_str("  <infoNotaCredito>\n");
    xml_tag(&mut xml, 4, "fechaEmision", &fecha_sri(clave.fecha_emision()));
    xml_tag(&mut xml, 4, "dirEstablecimiento", &xml_escape(&identidad.dir_establecimiento));
    xml_tag(&mut xml, 4, "tipoIdentificacionComprador", comprador.tipo_identificacion.codigo());
    xml_tag(&mut xml, 4, "razonSocialComprador", &xml_escape(&comprador.razon_social));
    xml_tag(&mut xml, 4, "identificacionComprador", &xml_escape(&comprador.identificacion));
    if let Some(ref especial) = identidad.contribuyente_especial {
        xml_tag(&mut xml, 4, "contribuyenteEspecial", &xml_escape(especial));
    }
    xml_tag(&mut xml, 4, "obligadoContabilidad", identidad.obligado_contabilidad_sri());

    // Referencia al documento modificado
    xml_tag(&mut xml, 4, "codDocModificado", &sustento.cod_doc_modificado);
    xml_tag(&mut xml, 4, "numDocModificado", &sustento.num_doc_modificado);
    xml_tag(&mut xml, 4, "fechaEmisionDocSustento", &fecha_sri(sustento.fecha_emision_doc_sustento));
    xml_tag(&mut xml, 4, "totalSinImpuestos", &monto(totales.total_sin_impuestos));
    xml_tag(&mut xml, 4, "valorModificacion", &monto(totales.importe_total));
    xml_tag(&mut xml, 4, "moneda", "DOLAR");

    total_con_impuestos(&mut xml, impuestos_totales);

    xml_tag(&mut xml, 4, "motivo", &xml_escape(&sustento.motivo));

    xml.push_str("  </infoNotaCredito>\n");

    detalles_xml(&mut xml, detalles, "codigoInterno");
    info_adicional(&mut xml, &campos_adicionales(comprador));

    cerrar_raiz(&mut xml, TipoComprobante::NotaCredito);
    Ok(xml)
}

/// Declaracion y tag raiz con el id que referencia la firma
fn abrir_raiz(xml: &mut String, tipo: TipoComprobante, version: &str) {
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str(&format!(
        "<{} id=\"comprobante\" version=\"{}\">\n",
        tipo.tag_raiz(),
        version
    ));
}

fn cerrar_raiz(xml: &mut String, tipo: TipoComprobante) {
    xml.push_str(&format!("</{}>", tipo.tag_raiz()));
}

/// La clave debe corresponder al tipo de documento, RUC y ambiente del emisor
fn verificar_clave(
    identidad: &IdentidadFiscal,
    clave: &ClaveAcceso,
    tipo: TipoComprobante,
) -> Result<(), ErrorSri> {
    let c = clave.as_str();
    if clave.cod_doc() != tipo.codigo()
        || &c[10..23] != identidad.ruc
        || &c[23..24] != identidad.ambiente.codigo()
        || &c[24..27] != identidad.establecimiento
        || &c[27..30] != identidad.punto_emision
    {
        return Err(ErrorSri::Validacion(format!(
            "La clave de acceso {} no corresponde al emisor o tipo de documento",
            c
        )));
    }
    Ok(())
}

// === infoTributaria ===
fn info_tributaria(xml: &mut String, identidad: &IdentidadFiscal, clave: &ClaveAcceso, tipo: TipoComprobante) {
    xml.push_str("  <infoTributaria>\n");
    xml_tag(xml, 4, "ambiente", identidad.ambiente.codigo());
    xml_tag(xml, 4, "tipoEmision", EMISION_NORMAL);
    xml_tag(xml, 4, "razonSocial", &xml_escape(&identidad.razon_social));
    if let Some(ref nombre) = identidad.nombre_comercial {
        xml_tag(xml, 4, "nombreComercial", &xml_escape(nombre));
    }
    xml_tag(xml, 4, "ruc", &identidad.ruc);
    xml_tag(xml, 4, "claveAcceso", clave.as_str());
    xml_tag(xml, 4, "codDoc", tipo.codigo());
    xml_tag(xml, 4, "estab", &identidad.establecimiento);
    xml_tag(xml, 4, "ptoEmi", &identidad.punto_emision);
    xml_tag(xml, 4, "secuencial", clave.secuencial());
    xml_tag(xml, 4, "dirMatriz", &xml_escape(&identidad.dir_matriz));

    if let Some(rimpe) = identidad.regimen_rimpe {
        xml_tag(xml, 4, "contribuyenteRimpe", rimpe.leyenda());
    }

    xml.push_str("  </infoTributaria>\n");
}

fn total_con_impuestos(xml: &mut String, impuestos: &[ImpuestoTotal]) {
    xml.push_str("    <totalConImpuestos>\n");
    for imp in impuestos {
        xml.push_str("      <totalImpuesto>\n");
        xml_tag(xml, 8, "codigo", &imp.codigo);
        xml_tag(xml, 8, "codigoPorcentaje", &imp.codigo_porcentaje);
        xml_tag(xml, 8, "baseImponible", &monto(imp.base_imponible));
        xml_tag(xml, 8, "valor", &monto(imp.valor));
        xml.push_str("      </totalImpuesto>\n");
    }
    xml.push_str("    </totalConImpuestos>\n");
}

// === detalles ===
fn detalles_xml(xml: &mut String, detalles: &[DetalleFactura], tag_codigo: &str) {
    xml.push_str("  <detalles>\n");
    for det in detalles {
        xml.push_str("    <detalle>\n");
        xml_tag(xml, 6, tag_codigo, &xml_escape(&det.codigo_principal));
        xml_tag(xml, 6, "descripcion", &xml_escape(&det.descripcion));
        xml_tag(xml, 6, "cantidad", &format!("{:.6}", det.cantidad));
        xml_tag(xml, 6, "precioUnitario", &format!("{:.6}", det.precio_unitario));
        xml_tag(xml, 6, "descuento", &monto(det.descuento));
        xml_tag(xml, 6, "precioTotalSinImpuesto", &monto(det.precio_total_sin_impuesto));

        xml.push_str("      <impuestos>\n");
        xml.push_str("        <impuesto>\n");
        xml_tag(xml, 10, "codigo", &det.codigo_impuesto);
        xml_tag(xml, 10, "codigoPorcentaje", &det.codigo_porcentaje);
        xml_tag(xml, 10, "tarifa", &format!("{:.2}", det.tarifa));
        xml_tag(xml, 10, "baseImponible", &monto(det.base_imponible));
        xml_tag(xml, 10, "valor", &monto(det.valor));
        xml.push_str("        </impuesto>\n");
        xml.push_str("      </impuestos>\n");

        xml.push_str("    </detalle>\n");
    }
    xml.push_str("  </detalles>\n");
}

/// Campos adicionales del comprador (solo los que tienen valor)
fn campos_adicionales(comprador: &Comprador) -> Vec<CampoAdicional> {
    [
        ("email", &comprador.email),
        ("telefono", &comprador.telefono),
        ("direccion", &comprador.direccion),
    ]
    .into_iter()
    .filter_map(|(nombre, valor)| {
        valor
            .as_ref()
            .filter(|v| !v.trim().is_empty())
            .map(|v| CampoAdicional {
                nombre: nombre.to_string(),
                valor: v.clone(),
            })
    })
    .collect()
}

// === infoAdicional (opcional) ===
fn info_adicional(xml: &mut String, campos: &[CampoAdicional]) {
    if campos.is_empty() {
        return;
    }
    xml.push_str("  <infoAdicional>\n");
    for campo in campos {
        xml.push_str(&format!(
            "    <campoAdicional nombre=\"{}\">{}</campoAdicional>\n",
            xml_escape(&campo.nombre),
            xml_escape(&campo.valor)
        ));
    }
    xml.push_str("  </infoAdicional>\n");
}

/// Escribe un tag XML sin self-closing: <tag>value</tag>
fn xml_tag(xml: &mut String, indent: usize, tag: &str, value: &str) {
    let spaces = " ".repeat(indent);
    xml.push_str(&format!("{}<{}>{}</{}>\n", spaces, tag, value, tag));
}

/// Monto con 2 decimales, sin "-0.00"
fn monto(valor: f64) -> String {
    format!("{:.2}", redondear2(valor) + 0.0)
}

/// Fecha en formato SRI dd/mm/yyyy
pub fn fecha_sri(fecha: NaiveDate) -> String {
    fecha.format("%d/%m/%Y").to_string()
}

/// Normaliza texto para XML del SRI Ecuador.
/// Remueve caracteres de control, normaliza Unicode problematico y espacios.
fn normalize_text(s: &str) -> String {
    let mut result = String::with_capacity(s.len());

    for ch in s.chars() {
        match ch {
            // Remover caracteres de control (excepto tab, newline, carriage return)
            '\x00'..='\x08' | '\x0B' | '\x0C' | '\x0E'..='\x1F' | '\x7F' => {}
            // Comillas simples curvas -> recta
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' => result.push('\''),
            // Comillas dobles curvas -> recta
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' => result.push('"'),
            // Guiones largos -> guion normal
            '\u{2013}' | '\u{2014}' | '\u{2015}' => result.push('-'),
            // Elipsis -> tres puntos
            '\u{2026}' => result.push_str("..."),
            // Non-breaking space -> espacio normal
            '\u{00A0}' => result.push(' '),
            // Soft hyphen -> remover
            '\u{00AD}' => {}
            _ => result.push(ch),
        }
    }

    // Colapsar multiples espacios en uno y trim
    let mut collapsed = String::with_capacity(result.len());
    let mut prev_space = false;
    for ch in result.trim().chars() {
        if ch.is_whitespace() {
            if !prev_space {
                collapsed.push(' ');
            }
            prev_space = true;
        } else {
            collapsed.push(ch);
            prev_space = false;
        }
    }

    collapsed
}

/// Escapa caracteres especiales XML (con normalizacion previa)
pub fn xml_escape(s: &str) -> String {
    let normalized = normalize_text(s);
    normalized
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
