use crate::error::ErrorSri;
use crate::sri::certificado::Certificado;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, FixedOffset, Local, SecondsFormat};
use rand::Rng;
use rsa::pkcs1v15::SigningKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::traits::PublicKeyParts;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

const NS_DS: &str = "http://www.w3.org/2000/09/xmldsig#";
const NS_ETSI: &str = "http://uri.etsi.org/01903/v1.3.2#";
const ALG_C14N: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315";
const ALG_RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
const ALG_SHA256: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
const ALG_ENVELOPED: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

/// Resultado de firmar un XML
#[derive(Debug, Clone, PartialEq)]
pub struct XmlFirmado {
    pub xml: String,
}

/// Parametros variables de la firma. Fijarlos hace la firma reproducible.
#[derive(Debug, Clone)]
pub struct OpcionesFirma {
    /// SigningTime de XAdES
    pub momento: DateTime<FixedOffset>,
    /// Sufijo de los Id del bloque de firma
    pub id: u32,
}

impl OpcionesFirma {
    pub fn ahora() -> Self {
        OpcionesFirma {
            momento: Local::now().fixed_offset(),
            id: rand::thread_rng().gen_range(100_000..=999_999),
        }
    }
}

/// Firma un XML de comprobante electronico con XAdES-BES para el SRI de Ecuador.
///
/// Flujo:
/// 1. Ubica el tag raiz y verifica que el documento no este firmado
/// 2. Digest C14N del comprobante (referencia #comprobante, transformada enveloped)
/// 3. Digest de KeyInfo (certificado + modulo/exponente RSA)
/// 4. Digest de SignedProperties (hora de firma, digest e issuer/serial del certificado)
/// 5. SignedInfo con las tres referencias, firmado RSA-SHA256
/// 6. Inserta ds:Signature justo antes del cierre del tag raiz
///
/// Cada digest se calcula sobre el elemento con los namespaces ds y etsi
/// declarados en el tag de apertura, que es como queda al canonicalizarlo
/// dentro de ds:Signature.
pub fn firmar_comprobante(
    xml_sin_firma: &str,
    certificado: &Certificado,
    opciones: &OpcionesFirma,
) -> Result<XmlFirmado, ErrorSri> {
    // 1. Documento sin declaracion ni espacios al borde
    let documento = sin_declaracion(xml_sin_firma);
    let raiz = nombre_raiz(documento)?;
    let cierre = format!("</{}>", raiz);
    if !documento.ends_with(&cierre) {
        return Err(ErrorSri::Cripto(format!(
            "No se encontro el cierre del tag raiz <{}>",
            raiz
        )));
    }
    if ya_firmado(documento) {
        return Err(ErrorSri::Cripto("El comprobante ya tiene una firma".to_string()));
    }

    debug!(raiz, id = opciones.id, "Firmando comprobante");

    let info = certificado.info();
    let id = opciones.id;
    let ids = Ids::nuevo(id);

    // 2. Digest del comprobante, sobre su forma canonica
    let digest_documento = digest_b64(forma_canonica(documento)?.as_bytes());

    // 3. KeyInfo
    let certificado_b64 = BASE64.encode(certificado.certificado_der());
    let (modulo, exponente) = certificado.con_llave(|llave| {
        Ok((
            BASE64.encode(llave.n().to_bytes_be()),
            BASE64.encode(llave.e().to_bytes_be()),
        ))
    })?;
    let key_info = |ns: &str| {
        format!(
            "<ds:KeyInfo{ns} Id=\"{id_cert}\"><ds:X509Data><ds:X509Certificate>{cert}</ds:X509Certificate></ds:X509Data><ds:KeyValue><ds:RSAKeyValue><ds:Modulus>{modulo}</ds:Modulus><ds:Exponent>{exponente}</ds:Exponent></ds:RSAKeyValue></ds:KeyValue></ds:KeyInfo>",
            ns = ns,
            id_cert = ids.certificado,
            cert = certificado_b64,
            modulo = modulo,
            exponente = exponente,
        )
    };
    let digest_key_info = digest_b64(key_info(&namespaces()).as_bytes());

    // 4. SignedProperties
    let digest_certificado = digest_b64(certificado.certificado_der());
    let signed_properties = |ns: &str| {
        format!(
            "<etsi:SignedProperties{ns} Id=\"{id_props}\"><etsi:SignedSignatureProperties><etsi:SigningTime>{momento}</etsi:SigningTime><etsi:SigningCertificate><etsi:Cert><etsi:CertDigest><ds:DigestMethod Algorithm=\"{alg}\"></ds:DigestMethod><ds:DigestValue>{digest_cert}</ds:DigestValue></etsi:CertDigest><etsi:IssuerSerial><ds:X509IssuerName>{emisor}</ds:X509IssuerName><ds:X509SerialNumber>{serial}</ds:X509SerialNumber></etsi:IssuerSerial></etsi:Cert></etsi:SigningCertificate></etsi:SignedSignatureProperties><etsi:SignedDataObjectProperties><etsi:DataObjectFormat ObjectReference=\"#{id_ref}\"><etsi:Description>contenido comprobante</etsi:Description><etsi:MimeType>text/xml</etsi:MimeType></etsi:DataObjectFormat></etsi:SignedDataObjectProperties></etsi:SignedProperties>",
            ns = ns,
            id_props = ids.signed_properties,
            momento = opciones.momento.to_rfc3339_opts(SecondsFormat::Secs, false),
            alg = ALG_SHA256,
            digest_cert = digest_certificado,
            emisor = escapar_texto(&info.emisor),
            serial = info.serial,
            id_ref = ids.referencia,
        )
    };
    let digest_signed_properties = digest_b64(signed_properties(&namespaces()).as_bytes());

    // 5. SignedInfo
    let signed_info = |ns: &str| {
        format!(
            "<ds:SignedInfo{ns} Id=\"{id_si}\"><ds:CanonicalizationMethod Algorithm=\"{c14n}\"></ds:CanonicalizationMethod><ds:SignatureMethod Algorithm=\"{rsa}\"></ds:SignatureMethod><ds:Reference Id=\"{id_ref_props}\" Type=\"http://uri.etsi.org/01903#SignedProperties\" URI=\"#{id_props}\"><ds:DigestMethod Algorithm=\"{sha}\"></ds:DigestMethod><ds:DigestValue>{d_props}</ds:DigestValue></ds:Reference><ds:Reference URI=\"#{id_cert}\"><ds:DigestMethod Algorithm=\"{sha}\"></ds:DigestMethod><ds:DigestValue>{d_key}</ds:DigestValue></ds:Reference><ds:Reference Id=\"{id_ref}\" URI=\"#comprobante\"><ds:Transforms><ds:Transform Algorithm=\"{enveloped}\"></ds:Transform></ds:Transforms><ds:DigestMethod Algorithm=\"{sha}\"></ds:DigestMethod><ds:DigestValue>{d_doc}</ds:DigestValue></ds:Reference></ds:SignedInfo>",
            ns = ns,
            id_si = ids.signed_info,
            c14n = ALG_C14N,
            rsa = ALG_RSA_SHA256,
            id_ref_props = ids.referencia_props,
            id_props = ids.signed_properties,
            sha = ALG_SHA256,
            d_props = digest_signed_properties,
            id_cert = ids.certificado,
            d_key = digest_key_info,
            id_ref = ids.referencia,
            enveloped = ALG_ENVELOPED,
            d_doc = digest_documento,
        )
    };
    let signed_info_c14n = signed_info(&namespaces());

    let firma = certificado.con_llave(|llave| {
        let signing_key = SigningKey::<Sha256>::new(llave.clone());
        signing_key
            .try_sign(signed_info_c14n.as_bytes())
            .map(|s| s.to_bytes())
            .map_err(|e| ErrorSri::Cripto(format!("La llave no pudo firmar: {}", e)))
    })?;
    let signature_value = BASE64.encode(&firma);

    // 6. Bloque completo e insercion
    let bloque = format!(
        "<ds:Signature xmlns:ds=\"{ds}\" xmlns:etsi=\"{etsi}\" Id=\"{id_sig}\">{si}<ds:SignatureValue Id=\"{id_sv}\">{sv}</ds:SignatureValue>{ki}<ds:Object Id=\"{id_obj}\"><etsi:QualifyingProperties Target=\"#{id_sig}\">{sp}</etsi:QualifyingProperties></ds:Object></ds:Signature>",
        ds = NS_DS,
        etsi = NS_ETSI,
        id_sig = ids.firma,
        si = signed_info(""),
        id_sv = ids.signature_value,
        sv = signature_value,
        ki = key_info(""),
        id_obj = ids.objeto,
        sp = signed_properties(""),
    );

    let cuerpo = &documento[..documento.len() - cierre.len()];
    let mut xml = String::with_capacity(documento.len() + bloque.len() + 64);
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str(cuerpo);
    xml.push_str(&bloque);
    xml.push_str(&cierre);

    info!(bytes = xml.len(), "FIRMA OK");

    Ok(XmlFirmado { xml })
}

/// Identificadores del bloque de firma, derivados del sufijo numerico
struct Ids {
    firma: String,
    signed_info: String,
    signed_properties: String,
    referencia_props: String,
    referencia: String,
    certificado: String,
    signature_value: String,
    objeto: String,
}

impl Ids {
    fn nuevo(id: u32) -> Self {
        let firma = format!("Signature{}", id);
        Ids {
            signed_info: format!("Signature-SignedInfo{}", id),
            signed_properties: format!("{}-SignedProperties{}", firma, id),
            referencia_props: format!("SignedPropertiesID{}", id),
            referencia: format!("Reference-ID-{}", id),
            certificado: format!("Certificate{}", id),
            signature_value: format!("SignatureValue{}", id),
            objeto: format!("{}-Object{}", firma, id),
            firma,
        }
    }
}

fn namespaces() -> String {
    format!(" xmlns:ds=\"{}\" xmlns:etsi=\"{}\"", NS_DS, NS_ETSI)
}

fn digest_b64(datos: &[u8]) -> String {
    BASE64.encode(Sha256::digest(datos))
}

fn sin_declaracion(xml: &str) -> &str {
    let xml = xml.trim();
    if xml.starts_with("<?xml") {
        if let Some(fin) = xml.find("?>") {
            return xml[fin + 2..].trim();
        }
    }
    xml
}

/// Nombre del primer elemento del documento
fn nombre_raiz(documento: &str) -> Result<&str, ErrorSri> {
    let inicio = documento
        .strip_prefix('<')
        .filter(|resto| !resto.starts_with('?') && !resto.starts_with('!'))
        .ok_or_else(|| ErrorSri::Cripto("El documento no inicia con un elemento XML".to_string()))?;
    let fin = inicio
        .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
        .unwrap_or(inicio.len());
    let nombre = &inicio[..fin];
    if nombre.is_empty() {
        return Err(ErrorSri::Cripto("Tag raiz vacio".to_string()));
    }
    Ok(nombre)
}

fn ya_firmado(documento: &str) -> bool {
    documento.contains("<ds:Signature") || documento.contains("<Signature")
}

fn xml_invalido(detalle: &str) -> ErrorSri {
    ErrorSri::Cripto(format!("XML no canonicalizable: {}", detalle))
}

/// Forma canonica (C14N inclusivo, sin comentarios) del documento.
///
/// Las referencias a caracteres se resuelven y se vuelven a escapar con las
/// reglas de C14N: en texto `"` y `'` quedan literales, en atributos solo se
/// escapan `&`, `<`, `"` y los espacios de control. Tambien expande los tags
/// vacios, pasa los atributos a comillas dobles y los ordena.
fn forma_canonica(documento: &str) -> Result<String, ErrorSri> {
    let mut salida = String::with_capacity(documento.len());
    let mut resto = documento;
    while !resto.is_empty() {
        if let Some(cdata) = resto.strip_prefix("<![CDATA[") {
            let fin = cdata.find("]]>").ok_or_else(|| xml_invalido("CDATA sin cerrar"))?;
            escapar_canonico(&cdata[..fin], false, &mut salida);
            resto = &cdata[fin + 3..];
        } else if let Some(comentario) = resto.strip_prefix("<!--") {
            let fin = comentario.find("-->").ok_or_else(|| xml_invalido("comentario sin cerrar"))?;
            resto = &comentario[fin + 3..];
        } else if resto.starts_with("<!") {
            return Err(xml_invalido("declaraciones DTD no soportadas"));
        } else if resto.starts_with("<?") {
            let fin = resto.find("?>").ok_or_else(|| xml_invalido("instruccion sin cerrar"))? + 2;
            salida.push_str(&resto[..fin]);
            resto = &resto[fin..];
        } else if resto.starts_with('<') {
            let fin = fin_de_tag(resto)?;
            tag_canonico(&resto[..=fin], &mut salida)?;
            resto = &resto[fin + 1..];
        } else {
            let fin = resto.find('<').unwrap_or(resto.len());
            escapar_canonico(&decodificar(&resto[..fin], false)?, false, &mut salida);
            resto = &resto[fin..];
        }
    }
    Ok(salida)
}

/// Posicion del `>` que cierra el tag, ignorando los que van entre comillas
fn fin_de_tag(xml: &str) -> Result<usize, ErrorSri> {
    let mut comilla: Option<char> = None;
    for (i, c) in xml.char_indices() {
        match (comilla, c) {
            (None, '"') | (None, '\'') => comilla = Some(c),
            (Some(q), _) if q == c => comilla = None,
            (None, '>') => return Ok(i),
            _ => {}
        }
    }
    Err(xml_invalido("tag sin cerrar"))
}

fn tag_canonico(tag: &str, salida: &mut String) -> Result<(), ErrorSri> {
    let interior = &tag[1..tag.len() - 1];
    if let Some(nombre) = interior.strip_prefix('/') {
        salida.push_str("</");
        salida.push_str(nombre.trim());
        salida.push('>');
        return Ok(());
    }

    let (interior, vacio) = match interior.strip_suffix('/') {
        Some(sin_barra) => (sin_barra, true),
        None => (interior, false),
    };
    let fin_nombre = interior.find(char::is_whitespace).unwrap_or(interior.len());
    let nombre = &interior[..fin_nombre];
    if nombre.is_empty() {
        return Err(xml_invalido(tag));
    }

    let mut atributos = Vec::new();
    let mut resto = interior[fin_nombre..].trim_start();
    while !resto.is_empty() {
        let igual = resto.find('=').ok_or_else(|| xml_invalido(tag))?;
        let clave = resto[..igual].trim();
        let valor = resto[igual + 1..].trim_start();
        let comilla = valor
            .chars()
            .next()
            .filter(|c| *c == '"' || *c == '\'')
            .ok_or_else(|| xml_invalido(tag))?;
        let cierre = valor[1..].find(comilla).ok_or_else(|| xml_invalido(tag))? + 1;
        atributos.push((clave, decodificar(&valor[1..cierre], true)?));
        resto = valor[cierre + 1..].trim_start();
    }
    // Primero las declaraciones de namespace, luego el resto por nombre
    atributos.sort_by_key(|(clave, _)| (*clave != "xmlns" && !clave.starts_with("xmlns:"), *clave));

    salida.push('<');
    salida.push_str(nombre);
    for (clave, valor) in &atributos {
        salida.push(' ');
        salida.push_str(clave);
        salida.push_str("=\"");
        escapar_canonico(valor, true, salida);
        salida.push('"');
    }
    salida.push('>');
    if vacio {
        salida.push_str("</");
        salida.push_str(nombre);
        salida.push('>');
    }
    Ok(())
}

/// Resuelve entidades y referencias numericas. Normaliza los saltos de linea
/// y, dentro de atributos, los espacios de control.
fn decodificar(texto: &str, atributo: bool) -> Result<String, ErrorSri> {
    let mut salida = String::with_capacity(texto.len());
    let mut chars = texto.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            '&' => {
                let fin = texto[i..].find(';').ok_or_else(|| xml_invalido("entidad sin cerrar"))? + i;
                let nombre = &texto[i + 1..fin];
                let decodificado = match nombre {
                    "amp" => Some('&'),
                    "lt" => Some('<'),
                    "gt" => Some('>'),
                    "quot" => Some('"'),
                    "apos" => Some('\''),
                    _ => nombre
                        .strip_prefix("#x")
                        .map(|hex| u32::from_str_radix(hex, 16))
                        .or_else(|| nombre.strip_prefix('#').map(|dec| dec.parse::<u32>()))
                        .and_then(|n| n.ok())
                        .and_then(char::from_u32),
                };
                let decodificado = decodificado
                    .ok_or_else(|| xml_invalido(&format!("entidad desconocida &{};", nombre)))?;
                salida.push(decodificado);
                while chars.peek().map_or(false, |(j, _)| *j <= fin) {
                    chars.next();
                }
            }
            '\r' => {
                if chars.peek().map(|(_, s)| *s) == Some('\n') {
                    chars.next();
                }
                salida.push(if atributo { ' ' } else { '\n' });
            }
            '\n' | '\t' if atributo => salida.push(' '),
            _ => salida.push(c),
        }
    }
    Ok(salida)
}

fn escapar_canonico(texto: &str, atributo: bool, salida: &mut String) {
    for c in texto.chars() {
        match c {
            '&' => salida.push_str("&amp;"),
            '<' => salida.push_str("&lt;"),
            '>' if !atributo => salida.push_str("&gt;"),
            '"' if atributo => salida.push_str("&quot;"),
            '\t' if atributo => salida.push_str("&#x9;"),
            '\n' if atributo => salida.push_str("&#xA;"),
            '\r' => salida.push_str("&#xD;"),
            _ => salida.push(c),
        }
    }
}

fn escapar_texto(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}
