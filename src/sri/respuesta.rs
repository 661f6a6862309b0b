//! Lectura de las respuestas SOAP del SRI.
//!
//! Las respuestas llegan con prefijos de namespace variables (`ns2:`, `soap:`,
//! `S:`), por eso se arma un arbol con nombres locales y se busca por nombre.
use crate::error::ErrorSri;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Codigo del SRI: "clave de acceso en procesamiento"
pub const ERROR_CLAVE_EN_PROCESAMIENTO: &str = "70";

/// Mensaje estructurado del SRI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MensajeSri {
    pub identificador: String,
    pub mensaje: String,
    pub informacion_adicional: Option<String>,
    /// ERROR o ADVERTENCIA
    pub tipo: String,
}

impl fmt::Display for MensajeSri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {} - {}", self.identificador, self.mensaje)?;
        if let Some(ref info) = self.informacion_adicional {
            write!(f, " - {}", info)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EstadoRecepcion {
    Recibida,
    Devuelta,
}

/// Respuesta de `validarComprobante`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultadoRecepcion {
    pub estado: EstadoRecepcion,
    /// Clave del comprobante devuelto (solo viene con DEVUELTA)
    pub clave_acceso: Option<String>,
    pub mensajes: Vec<MensajeSri>,
}

impl ResultadoRecepcion {
    /// DEVUELTA solo por error 70: el SRI ya tiene el comprobante y se debe
    /// pasar directo a consultar la autorizacion.
    pub fn clave_en_procesamiento(&self) -> bool {
        self.estado == EstadoRecepcion::Devuelta
            && !self.mensajes.is_empty()
            && self
                .mensajes
                .iter()
                .all(|m| m.identificador == ERROR_CLAVE_EN_PROCESAMIENTO)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EstadoAutorizacion {
    Autorizado,
    NoAutorizado,
    /// El SRI aun no tiene decision (o no encuentra la clave todavia)
    EnProceso,
}

/// Respuesta de `autorizacionComprobante`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultadoAutorizacion {
    pub estado: EstadoAutorizacion,
    /// Clave que el SRI dice haber consultado
    pub clave_acceso: Option<String>,
    pub numero_autorizacion: Option<String>,
    pub fecha_autorizacion: Option<String>,
    pub ambiente: Option<String>,
    /// Copia del comprobante autorizado que devuelve el SRI
    pub comprobante: Option<String>,
    pub mensajes: Vec<MensajeSri>,
}

impl ResultadoAutorizacion {
    pub fn en_proceso() -> Self {
        ResultadoAutorizacion {
            estado: EstadoAutorizacion::EnProceso,
            clave_acceso: None,
            numero_autorizacion: None,
            fecha_autorizacion: None,
            ambiente: None,
            comprobante: None,
            mensajes: Vec::new(),
        }
    }
}

/// Parsea el body de `validarComprobanteResponse`.
pub fn parsear_respuesta_recepcion(body: &str) -> Result<ResultadoRecepcion, ErrorSri> {
    let raiz = parsear_arbol(body)?;
    verificar_fault(&raiz)?;

    let respuesta = raiz.buscar("RespuestaRecepcionComprobante").ok_or_else(|| {
        ErrorSri::Protocolo("La respuesta no contiene RespuestaRecepcionComprobante".to_string())
    })?;

    let estado = respuesta
        .hijo("estado")
        .map(|n| n.texto.as_str())
        .ok_or_else(|| ErrorSri::Protocolo("La respuesta de recepcion no tiene estado".to_string()))?;

    let estado = match estado {
        "RECIBIDA" => EstadoRecepcion::Recibida,
        "DEVUELTA" => EstadoRecepcion::Devuelta,
        otro => {
            return Err(ErrorSri::Protocolo(format!(
                "Estado de recepcion desconocido: '{}'",
                otro
            )))
        }
    };

    Ok(ResultadoRecepcion {
        estado,
        clave_acceso: respuesta
            .buscar("claveAcceso")
            .map(|n| n.texto.clone())
            .filter(|t| !t.is_empty()),
        mensajes: mensajes_de(respuesta),
    })
}

/// Parsea el body de `autorizacionComprobanteResponse`.
///
/// Sin nodos `autorizacion` el SRI aun no procesa la clave: `EnProceso`.
/// Si hay varias autorizaciones (reintentos previos) gana la AUTORIZADO.
pub fn parsear_respuesta_autorizacion(body: &str) -> Result<ResultadoAutorizacion, ErrorSri> {
    let raiz = parsear_arbol(body)?;
    verificar_fault(&raiz)?;

    let respuesta = raiz.buscar("RespuestaAutorizacionComprobante").ok_or_else(|| {
        ErrorSri::Protocolo("La respuesta no contiene RespuestaAutorizacionComprobante".to_string())
    })?;

    let mut autorizaciones = Vec::new();
    respuesta.buscar_todos("autorizacion", &mut autorizaciones);

    let elegida = autorizaciones
        .iter()
        .find(|a| a.texto_de("estado") == Some("AUTORIZADO"))
        .or_else(|| autorizaciones.first());

    let consultada = respuesta.texto_de("claveAccesoConsultada");
    let autorizacion = match elegida {
        Some(a) => a,
        None => {
            return Ok(ResultadoAutorizacion {
                clave_acceso: consultada.map(|s| s.to_string()),
                ..ResultadoAutorizacion::en_proceso()
            })
        }
    };

    let estado = match autorizacion.texto_de("estado") {
        Some("AUTORIZADO") => EstadoAutorizacion::Autorizado,
        Some("NO AUTORIZADO") | Some("RECHAZADO") => EstadoAutorizacion::NoAutorizado,
        Some("EN PROCESO") | Some("EN PROCESAMIENTO") | Some("PROCESAMIENTO") => {
            EstadoAutorizacion::EnProceso
        }
        Some(otro) => {
            return Err(ErrorSri::Protocolo(format!(
                "Estado de autorizacion desconocido: '{}'",
                otro
            )))
        }
        None => {
            return Err(ErrorSri::Protocolo(
                "La autorizacion no tiene estado".to_string(),
            ))
        }
    };

    let texto = |tag: &str| autorizacion.texto_de(tag).map(|s| s.to_string());

    Ok(ResultadoAutorizacion {
        estado,
        clave_acceso: consultada
            .map(|s| s.to_string())
            .or_else(|| texto("claveAcceso")),
        numero_autorizacion: texto("numeroAutorizacion"),
        fecha_autorizacion: texto("fechaAutorizacion"),
        ambiente: texto("ambiente"),
        comprobante: texto("comprobante"),
        mensajes: mensajes_de(autorizacion),
    })
}

/// Nodo con nombre local, texto acumulado e hijos
#[derive(Debug, Default)]
struct Nodo {
    nombre: String,
    texto: String,
    hijos: Vec<Nodo>,
}

impl Nodo {
    fn hijo(&self, nombre: &str) -> Option<&Nodo> {
        self.hijos.iter().find(|h| h.nombre == nombre)
    }

    /// Texto de un hijo directo, None si falta o esta vacio
    fn texto_de(&self, nombre: &str) -> Option<&str> {
        self.hijo(nombre)
            .map(|h| h.texto.as_str())
            .filter(|t| !t.is_empty())
    }

    /// Primer descendiente (en profundidad) con ese nombre, incluido el propio nodo
    fn buscar(&self, nombre: &str) -> Option<&Nodo> {
        if self.nombre == nombre {
            return Some(self);
        }
        self.hijos.iter().find_map(|h| h.buscar(nombre))
    }

    fn buscar_todos<'a>(&'a self, nombre: &str, salida: &mut Vec<&'a Nodo>) {
        for hijo in &self.hijos {
            if hijo.nombre == nombre {
                salida.push(hijo);
            } else {
                hijo.buscar_todos(nombre, salida);
            }
        }
    }
}

/// Mensajes bajo `mensajes/mensaje`. El nodo `mensaje` se repite anidado
/// (el contenedor y su texto), se distinguen porque el contenedor tiene hijos.
fn mensajes_de(nodo: &Nodo) -> Vec<MensajeSri> {
    let mut contenedores = Vec::new();
    nodo.buscar_todos("mensajes", &mut contenedores);

    contenedores
        .iter()
        .flat_map(|c| c.hijos.iter())
        .filter(|m| m.nombre == "mensaje" && !m.hijos.is_empty())
        .map(|m| MensajeSri {
            identificador: m.texto_de("identificador").unwrap_or_default().to_string(),
            mensaje: m.texto_de("mensaje").unwrap_or_default().to_string(),
            informacion_adicional: m.texto_de("informacionAdicional").map(|s| s.to_string()),
            tipo: m.texto_de("tipo").unwrap_or("ERROR").to_string(),
        })
        .collect()
}

fn verificar_fault(raiz: &Nodo) -> Result<(), ErrorSri> {
    if let Some(fault) = raiz.buscar("Fault") {
        let detalle = fault
            .texto_de("faultstring")
            .or_else(|| fault.buscar("Text").map(|t| t.texto.as_str()))
            .unwrap_or("sin detalle");
        return Err(ErrorSri::Protocolo(format!("SOAP Fault: {}", detalle)));
    }
    Ok(())
}

fn parsear_arbol(body: &str) -> Result<Nodo, ErrorSri> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    // pila[0] es una raiz sintetica que recibe el elemento del documento
    let mut pila: Vec<Nodo> = vec![Nodo::default()];

    loop {
        let evento = reader
            .read_event()
            .map_err(|e| ErrorSri::Protocolo(format!("XML de respuesta invalido: {}", e)))?;
        match evento {
            Event::Start(e) => pila.push(Nodo {
                nombre: nombre_local(e.local_name().as_ref()),
                ..Nodo::default()
            }),
            Event::Empty(e) => {
                let nodo = Nodo {
                    nombre: nombre_local(e.local_name().as_ref()),
                    ..Nodo::default()
                };
                if let Some(padre) = pila.last_mut() {
                    padre.hijos.push(nodo);
                }
            }
            Event::Text(t) => {
                let texto = t
                    .unescape()
                    .map_err(|e| ErrorSri::Protocolo(format!("Texto XML invalido: {}", e)))?;
                if let Some(actual) = pila.last_mut() {
                    actual.texto.push_str(&texto);
                }
            }
            Event::CData(c) => {
                let contenido = c.into_inner();
                if let Some(actual) = pila.last_mut() {
                    actual.texto.push_str(&String::from_utf8_lossy(&contenido));
                }
            }
            Event::End(_) => {
                if pila.len() < 2 {
                    return Err(ErrorSri::Protocolo("Cierre de tag sin apertura".to_string()));
                }
                if let Some(mut nodo) = pila.pop() {
                    nodo.texto = nodo.texto.trim().to_string();
                    if let Some(padre) = pila.last_mut() {
                        padre.hijos.push(nodo);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if pila.len() != 1 {
        return Err(ErrorSri::Protocolo("Respuesta XML incompleta".to_string()));
    }
    pila.pop()
        .filter(|raiz| !raiz.hijos.is_empty())
        .ok_or_else(|| ErrorSri::Protocolo("Respuesta vacia del SRI".to_string()))
}

fn nombre_local(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECIBIDA: &str = include_str!("../../tests/fixtures/recepcion_recibida.xml");
    const DEVUELTA: &str = include_str!("../../tests/fixtures/recepcion_devuelta.xml");
    const AUTORIZADO: &str = include_str!("../../tests/fixtures/autorizacion_autorizado.xml");
    const NO_AUTORIZADO: &str = include_str!("../../tests/fixtures/autorizacion_no_autorizado.xml");

    #[test]
    fn test_recibida_sin_mensajes() {
        let r = parsear_respuesta_recepcion(RECIBIDA).unwrap();
        assert_eq!(r.estado, EstadoRecepcion::Recibida);
        assert!(r.clave_acceso.is_none());
        assert!(r.mensajes.is_empty());
        assert!(!r.clave_en_procesamiento());
    }

    #[test]
    fn test_devuelta_con_dos_mensajes() {
        let r = parsear_respuesta_recepcion(DEVUELTA).unwrap();
        assert_eq!(r.estado, EstadoRecepcion::Devuelta);
        assert_eq!(
            r.clave_acceso.as_deref(),
            Some("1102202601091234567800110010010000000011234567813")
        );
        assert_eq!(r.mensajes.len(), 2);
        assert_eq!(r.mensajes[0].identificador, "35");
        assert_eq!(r.mensajes[0].mensaje, "ARCHIVO NO CUMPLE ESTRUCTURA XML");
        assert_eq!(
            r.mensajes[0].informacion_adicional.as_deref(),
            Some("Se encontro el siguiente error en la estructura del comprobante: cvc-complex-type.2.4.a")
        );
        assert_eq!(r.mensajes[1].identificador, "26");
        assert_eq!(r.mensajes[1].tipo, "ERROR");
        assert!(r.mensajes[1].informacion_adicional.is_none());
    }

    #[test]
    fn test_error_70_es_clave_en_procesamiento() {
        let body = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body><ns2:validarComprobanteResponse xmlns:ns2="http://ec.gob.sri.ws.recepcion"><RespuestaRecepcionComprobante><estado>DEVUELTA</estado><comprobantes><comprobante><claveAcceso>123</claveAcceso><mensajes><mensaje><identificador>70</identificador><mensaje>CLAVE DE ACCESO EN PROCESAMIENTO</mensaje><tipo>ERROR</tipo></mensaje></mensajes></comprobante></comprobantes></RespuestaRecepcionComprobante></ns2:validarComprobanteResponse></soap:Body></soap:Envelope>"#;
        let r = parsear_respuesta_recepcion(body).unwrap();
        assert!(r.clave_en_procesamiento());
        assert_eq!(r.clave_acceso.as_deref(), Some("123"));
    }

    #[test]
    fn test_autorizado() {
        let r = parsear_respuesta_autorizacion(AUTORIZADO).unwrap();
        assert_eq!(r.estado, EstadoAutorizacion::Autorizado);
        assert_eq!(
            r.clave_acceso.as_deref(),
            Some("1102202601091234567800110010010000000011234567813")
        );
        assert_eq!(
            r.numero_autorizacion.as_deref(),
            Some("1102202601091234567800110010010000000011234567813")
        );
        assert_eq!(r.fecha_autorizacion.as_deref(), Some("2026-02-11T10:31:05-05:00"));
        assert_eq!(r.ambiente.as_deref(), Some("PRUEBAS"));
        let copia = r.comprobante.unwrap();
        assert!(copia.starts_with("<?xml"));
        assert!(copia.contains("<factura id=\"comprobante\""));
        assert!(r.mensajes.is_empty());
    }

    #[test]
    fn test_no_autorizado_con_mensaje() {
        let r = parsear_respuesta_autorizacion(NO_AUTORIZADO).unwrap();
        assert_eq!(r.estado, EstadoAutorizacion::NoAutorizado);
        assert_eq!(r.mensajes.len(), 1);
        assert_eq!(r.mensajes[0].identificador, "39");
        assert!(r.numero_autorizacion.is_none());
        assert!(r.clave_acceso.is_some());
    }

    #[test]
    fn test_sin_autorizaciones_es_en_proceso() {
        let body = r#"<S:Envelope xmlns:S="http://schemas.xmlsoap.org/soap/envelope/"><S:Body><ns2:autorizacionComprobanteResponse xmlns:ns2="http://ec.gob.sri.ws.autorizacion"><RespuestaAutorizacionComprobante><claveAccesoConsultada>123</claveAccesoConsultada><numeroComprobantes>0</numeroComprobantes><autorizaciones/></RespuestaAutorizacionComprobante></ns2:autorizacionComprobanteResponse></S:Body></S:Envelope>"#;
        let r = parsear_respuesta_autorizacion(body).unwrap();
        assert_eq!(r.estado, EstadoAutorizacion::EnProceso);
        assert_eq!(r.clave_acceso.as_deref(), Some("123"));
    }

    #[test]
    fn test_clave_dentro_de_la_autorizacion() {
        let body = r#"<S:Envelope xmlns:S="http://schemas.xmlsoap.org/soap/envelope/"><S:Body><ns2:autorizacionComprobanteResponse xmlns:ns2="http://ec.gob.sri.ws.autorizacion"><RespuestaAutorizacionComprobante><autorizaciones><autorizacion><estado>AUTORIZADO</estado><claveAcceso>456</claveAcceso><numeroAutorizacion>456</numeroAutorizacion></autorizacion></autorizaciones></RespuestaAutorizacionComprobante></ns2:autorizacionComprobanteResponse></S:Body></S:Envelope>"#;
        let r = parsear_respuesta_autorizacion(body).unwrap();
        assert_eq!(r.estado, EstadoAutorizacion::Autorizado);
        assert_eq!(r.clave_acceso.as_deref(), Some("456"));
    }

    #[test]
    fn test_soap_fault_es_error_de_protocolo() {
        let body = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body><soap:Fault><faultcode>soap:Server</faultcode><faultstring>Error interno</faultstring></soap:Fault></soap:Body></soap:Envelope>"#;
        match parsear_respuesta_recepcion(body) {
            Err(ErrorSri::Protocolo(msg)) => assert!(msg.contains("Error interno")),
            otro => panic!("se esperaba Protocolo, llego {:?}", otro),
        }
    }

    #[test]
    fn test_respuesta_sin_estado_o_basura() {
        let sin_estado = "<Envelope><Body><RespuestaRecepcionComprobante></RespuestaRecepcionComprobante></Body></Envelope>";
        assert!(matches!(
            parsear_respuesta_recepcion(sin_estado),
            Err(ErrorSri::Protocolo(_))
        ));
        assert!(matches!(
            parsear_respuesta_recepcion("<html><body>502 Bad Gateway</body></html>"),
            Err(ErrorSri::Protocolo(_))
        ));
        assert!(matches!(parsear_respuesta_autorizacion(""), Err(ErrorSri::Protocolo(_))));
    }
}
