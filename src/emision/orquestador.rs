//! Flujo de emision de comprobantes electronicos.
//!
//! 1. Lee identidad del tenant, valida el borrador y agrupa impuestos
//! 2. Carga el certificado (falla antes de tocar el contador o la BD)
//! 3. Asigna secuencial, genera clave de acceso y XML, firma. Un secuencial
//!    que no llega a registrarse queda como hueco del contador
//! 4. Persiste BORRADOR -> XML_GENERADO -> FIRMADO
//! 5. ENVIADO -> recepcion (con reintentos) -> RECIBIDO | DEVUELTO
//! 6. Sondeo de autorizacion -> AUTORIZADO | NO_AUTORIZADO, o queda RECIBIDO
//!
//! Un comprobante que queda en ENVIADO o RECIBIDO se retoma con `reanudar`
//! usando la misma clave de acceso y el mismo XML firmado.
use crate::config::{Ambiente, ConfigSri, IdentidadFiscal};
use crate::db::Database;
use crate::emision::cancelacion::SenalCancelacion;
use crate::emision::estados::EvidenciaAnulacion;
use crate::emision::repositorio::{DatosTransicion, NuevoComprobante, RepositorioComprobantes};
use crate::emision::secuencial::{ContadorSecuencial, ContadorSqlite};
use crate::error::ErrorSri;
use crate::models::{
    numero_documento, BorradorFactura, BorradorNotaCredito, Comprobante, EstadoComprobante,
    TipoComprobante, Totales, Transicion,
};
use crate::sri::certificado::{self, Certificado, InfoCertificado};
use crate::sri::clave_acceso::{codigo_numerico_aleatorio, generar_clave_acceso, ClaveAcceso, EMISION_NORMAL};
use crate::sri::firma::{firmar_comprobante, OpcionesFirma};
use crate::sri::impuestos::{agrupar_impuestos, redondear2};
use crate::sri::respuesta::{EstadoAutorizacion, EstadoRecepcion, MensajeSri};
use crate::sri::soap::ClienteAutoridad;
use crate::sri::xml::{generar_xml_factura, generar_xml_nota_credito, SustentoNotaCredito};
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

const TOLERANCIA: f64 = 0.005;

/// Firma electronica del emisor, entregada en cada llamada.
/// La contrasena se borra de memoria al soltar la credencial.
pub struct CredencialFirma {
    p12: Zeroizing<Vec<u8>>,
    password: Zeroizing<String>,
}

impl CredencialFirma {
    pub fn nueva(p12: Vec<u8>, password: impl Into<String>) -> Self {
        CredencialFirma {
            p12: Zeroizing::new(p12),
            password: Zeroizing::new(password.into()),
        }
    }

    fn cargar(&self) -> Result<Certificado, ErrorSri> {
        certificado::cargar(&self.p12, &self.password)
    }
}

impl fmt::Debug for CredencialFirma {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredencialFirma")
            .field("p12_bytes", &self.p12.len())
            .field("password", &"<redactada>")
            .finish()
    }
}

/// Resultado de emision para el llamador
#[derive(Debug, Clone, Serialize)]
pub struct ResultadoEmision {
    pub comprobante_id: i64,
    pub clave_acceso: ClaveAcceso,
    pub numero: String,
    /// AUTORIZADO, o RECIBIDO si el SRI aun no decide
    pub estado: EstadoComprobante,
    pub numero_autorizacion: Option<String>,
    pub fecha_autorizacion: Option<String>,
    /// Advertencias del SRI
    pub mensajes: Vec<MensajeSri>,
    pub mensaje: String,
}

impl ResultadoEmision {
    pub fn autorizado(&self) -> bool {
        self.estado == EstadoComprobante::Autorizado
    }

    /// El SRI recibio el comprobante pero no hubo decision dentro del sondeo
    pub fn en_proceso(&self) -> bool {
        self.estado == EstadoComprobante::Recibido
    }
}

/// Comprobante listo para numerar
struct Pendiente<'a> {
    tenant: &'a str,
    identidad: &'a IdentidadFiscal,
    tipo: TipoComprobante,
    fecha_emision: NaiveDate,
    importe_total: f64,
    documento_modificado: Option<ClaveAcceso>,
}

pub struct Orquestador<C: ClienteAutoridad> {
    db: Arc<Database>,
    repo: RepositorioComprobantes,
    contador: Arc<dyn ContadorSecuencial>,
    cliente: Arc<C>,
    config: ConfigSri,
}

impl<C: ClienteAutoridad> Orquestador<C> {
    pub fn nuevo(db: Arc<Database>, cliente: Arc<C>, config: ConfigSri) -> Self {
        Orquestador {
            repo: RepositorioComprobantes::nuevo(Arc::clone(&db)),
            contador: Arc::new(ContadorSqlite::nuevo(Arc::clone(&db))),
            db,
            cliente,
            config,
        }
    }

    /// Reemplaza el contador de secuenciales (p. ej. uno compartido entre instancias)
    pub fn con_contador(mut self, contador: Arc<dyn ContadorSecuencial>) -> Self {
        self.contador = contador;
        self
    }

    pub fn repositorio(&self) -> &RepositorioComprobantes {
        &self.repo
    }

    fn identidad(&self, tenant: &str) -> Result<IdentidadFiscal, ErrorSri> {
        IdentidadFiscal::desde_mapa(&self.db.leer_config(tenant)?)
    }

    /// Valida el P12 y su vigencia sin conservar la llave
    pub fn validar_certificado(&self, credencial: &CredencialFirma) -> Result<InfoCertificado, ErrorSri> {
        let cert = credencial.cargar()?;
        cert.verificar_vigencia(Utc::now())?;
        Ok(cert.info().clone())
    }

    /// Emite una factura electronica: genera, firma, envia y espera la autorizacion.
    pub async fn emitir_factura(
        &self,
        tenant: &str,
        borrador: &BorradorFactura,
        credencial: &CredencialFirma,
        cancelacion: SenalCancelacion,
    ) -> Result<ResultadoEmision, ErrorSri> {
        // 1. Identidad y datos
        let identidad = self.identidad(tenant)?;
        borrador.validar()?;
        let impuestos = agrupar_impuestos(&borrador.detalles)?;

        // 2. Certificado vigente
        let cert = credencial.cargar()?;
        cert.verificar_vigencia(Utc::now())?;

        // 3-4. Secuencial, clave, XML y firma
        let pendiente = Pendiente {
            tenant,
            identidad: &identidad,
            tipo: TipoComprobante::Factura,
            fecha_emision: borrador.fecha_emision,
            importe_total: borrador.totales.importe_total,
            documento_modificado: None,
        };
        let comprobante = self.numerar_y_firmar(
            pendiente,
            cert,
            |clave| {
                generar_xml_factura(
                    &identidad,
                    clave,
                    &borrador.comprador,
                    &borrador.detalles,
                    &impuestos,
                    &borrador.totales,
                    &borrador.pagos,
                )
            },
            |nuevo| self.repo.crear(nuevo),
        )?;

        // 5-6. Envio y autorizacion
        self.enviar_y_autorizar(comprobante, identidad.ambiente, cancelacion).await
    }

    /// Emite una nota de credito sobre una factura autorizada. Si se autoriza y
    /// cubre el total de la factura, la factura pasa a ANULADO.
    pub async fn emitir_nota_credito(
        &self,
        tenant: &str,
        borrador: &BorradorNotaCredito,
        credencial: &CredencialFirma,
        cancelacion: SenalCancelacion,
    ) -> Result<ResultadoEmision, ErrorSri> {
        let identidad = self.identidad(tenant)?;
        borrador.validar()?;

        // Factura sustento
        let factura = self
            .repo
            .buscar_por_clave(tenant, &borrador.factura)?
            .ok_or_else(|| {
                ErrorSri::Validacion(format!("Factura {} no encontrada", borrador.factura))
            })?;
        if factura.tipo != TipoComprobante::Factura || factura.estado != EstadoComprobante::Autorizado {
            return Err(ErrorSri::Validacion(format!(
                "Solo se puede emitir nota de credito sobre una factura AUTORIZADA (estado actual: {})",
                factura.estado
            )));
        }

        // Aviso temprano; el tope se vuelve a verificar al insertar
        let valor_modificacion = borrador.valor_modificacion()?;
        let acreditado = self.valor_acreditado(tenant, &factura)?;
        if acreditado + valor_modificacion > factura.importe_total + TOLERANCIA {
            return Err(ErrorSri::Validacion(format!(
                "La nota de credito ({:.2}) supera el saldo de la factura ({:.2})",
                valor_modificacion,
                redondear2(factura.importe_total - acreditado)
            )));
        }

        let impuestos = agrupar_impuestos(&borrador.detalles)?;
        let totales = Totales {
            total_sin_impuestos: borrador.total_sin_impuestos(),
            total_descuento: redondear2(borrador.detalles.iter().map(|d| d.descuento).sum()),
            propina: 0.0,
            importe_total: valor_modificacion,
        };
        let sustento = SustentoNotaCredito {
            cod_doc_modificado: TipoComprobante::Factura.codigo().to_string(),
            num_doc_modificado: factura.numero.clone(),
            fecha_emision_doc_sustento: factura.fecha_emision,
            motivo: borrador.motivo.clone(),
        };

        let cert = credencial.cargar()?;
        cert.verificar_vigencia(Utc::now())?;

        let pendiente = Pendiente {
            tenant,
            identidad: &identidad,
            tipo: TipoComprobante::NotaCredito,
            fecha_emision: borrador.fecha_emision,
            importe_total: valor_modificacion,
            documento_modificado: Some(factura.clave_acceso.clone()),
        };
        let comprobante = self.numerar_y_firmar(
            pendiente,
            cert,
            |clave| {
                generar_xml_nota_credito(
                    &identidad,
                    clave,
                    &borrador.comprador,
                    &borrador.detalles,
                    &impuestos,
                    &totales,
                    &sustento,
                )
            },
            |nuevo| self.repo.crear_nota_credito(nuevo, factura.importe_total),
        )?;

        self.enviar_y_autorizar(comprobante, identidad.ambiente, cancelacion).await
    }

    /// Retoma un comprobante pendiente con la misma clave.
    ///
    /// - FIRMADO o ENVIADO: reenvia el mismo XML firmado
    /// - RECIBIDO: solo consulta la autorizacion
    /// - AUTORIZADO: retorna el resultado guardado
    pub async fn reanudar(
        &self,
        tenant: &str,
        clave: &ClaveAcceso,
        cancelacion: SenalCancelacion,
    ) -> Result<ResultadoEmision, ErrorSri> {
        let identidad = self.identidad(tenant)?;
        let comprobante = self.consultar(tenant, clave)?;
        info!(clave_acceso = %clave, estado = %comprobante.estado, "=== REANUDAR ===");

        match comprobante.estado {
            EstadoComprobante::Firmado | EstadoComprobante::Enviado | EstadoComprobante::Recibido => {
                self.enviar_y_autorizar(comprobante, identidad.ambiente, cancelacion).await
            }
            EstadoComprobante::Autorizado => Ok(resultado(&comprobante, Vec::new())),
            EstadoComprobante::Devuelto | EstadoComprobante::NoAutorizado => {
                let mensajes = self
                    .repo
                    .mensajes(comprobante.id)?
                    .into_iter()
                    .map(|m| m.mensaje)
                    .collect();
                Err(ErrorSri::RechazoSri {
                    estado: comprobante.estado.to_string(),
                    mensajes,
                })
            }
            otro => Err(ErrorSri::TransicionInvalida {
                desde: otro.to_string(),
                hacia: EstadoComprobante::Enviado.to_string(),
            }),
        }
    }

    /// Estado actual del comprobante
    pub fn consultar(&self, tenant: &str, clave: &ClaveAcceso) -> Result<Comprobante, ErrorSri> {
        self.repo
            .buscar_por_clave(tenant, clave)?
            .ok_or_else(|| ErrorSri::Validacion(format!("Comprobante {} no encontrado", clave)))
    }

    pub fn obtener_xml_firmado(&self, tenant: &str, clave: &ClaveAcceso) -> Result<String, ErrorSri> {
        self.consultar(tenant, clave)?
            .xml_firmado
            .ok_or_else(|| ErrorSri::Validacion(format!("El comprobante {} no esta firmado", clave)))
    }

    pub fn historial(&self, tenant: &str, clave: &ClaveAcceso) -> Result<Vec<Transicion>, ErrorSri> {
        let comprobante = self.consultar(tenant, clave)?;
        self.repo.historial(comprobante.id)
    }

    /// Persiste el comprobante recorriendo BORRADOR -> XML_GENERADO -> FIRMADO
    /// Asigna el secuencial y completa lo que depende de el: clave, XML,
    /// firma y registro hasta FIRMADO. Si algo falla el numero queda
    /// registrado como hueco del contador.
    fn numerar_y_firmar(
        &self,
        pendiente: Pendiente<'_>,
        cert: Certificado,
        generar_xml: impl FnOnce(&ClaveAcceso) -> Result<String, ErrorSri>,
        insertar: impl FnOnce(&NuevoComprobante) -> Result<Comprobante, ErrorSri>,
    ) -> Result<Comprobante, ErrorSri> {
        let identidad = pendiente.identidad;
        let secuencial = self.contador.siguiente(
            pendiente.tenant,
            &identidad.establecimiento,
            &identidad.punto_emision,
            pendiente.tipo,
        )?;

        let tenant = pendiente.tenant;
        let tipo = pendiente.tipo;
        let resultado = self.firmar_y_registrar(pendiente, secuencial, cert, generar_xml, insertar);
        if let Err(ref e) = resultado {
            if let Err(otro) = self.contador.registrar_hueco(
                tenant,
                &identidad.establecimiento,
                &identidad.punto_emision,
                tipo,
                secuencial,
                &e.to_string(),
            ) {
                error!(tenant, secuencial, "No se pudo registrar el hueco del secuencial: {}", otro);
            }
        }
        resultado
    }

    fn firmar_y_registrar(
        &self,
        pendiente: Pendiente<'_>,
        secuencial: u64,
        cert: Certificado,
        generar_xml: impl FnOnce(&ClaveAcceso) -> Result<String, ErrorSri>,
        insertar: impl FnOnce(&NuevoComprobante) -> Result<Comprobante, ErrorSri>,
    ) -> Result<Comprobante, ErrorSri> {
        let identidad = pendiente.identidad;
        let clave = generar_clave_acceso(
            pendiente.fecha_emision,
            pendiente.tipo,
            &identidad.ruc,
            identidad.ambiente,
            &identidad.establecimiento,
            &identidad.punto_emision,
            secuencial,
            codigo_numerico_aleatorio(),
            EMISION_NORMAL,
        )?;
        info!(
            tenant = pendiente.tenant,
            clave_acceso = %clave,
            documento_modificado = ?pendiente.documento_modificado.as_ref().map(|c| c.as_str()),
            "========== INICIO EMISION {} ==========",
            pendiente.tipo.tag_raiz()
        );

        let xml = generar_xml(&clave)?;

        // La llave se suelta apenas termina la firma
        let firmado = firmar_comprobante(&xml, &cert, &OpcionesFirma::ahora())?;
        drop(cert);

        let nuevo = NuevoComprobante {
            tenant: pendiente.tenant.to_string(),
            tipo: pendiente.tipo,
            clave_acceso: clave,
            numero: numero_documento(&identidad.establecimiento, &identidad.punto_emision, secuencial),
            fecha_emision: pendiente.fecha_emision,
            importe_total: pendiente.importe_total,
            documento_modificado: pendiente.documento_modificado,
        };
        let comprobante = insertar(&nuevo)?;
        self.repo.transicionar(
            comprobante.id,
            EstadoComprobante::XmlGenerado,
            DatosTransicion {
                xml: Some(xml),
                ..Default::default()
            },
        )?;
        self.repo.transicionar(
            comprobante.id,
            EstadoComprobante::Firmado,
            DatosTransicion {
                xml_firmado: Some(firmado.xml),
                ..Default::default()
            },
        )
    }

    async fn enviar_y_autorizar(
        &self,
        mut comprobante: Comprobante,
        ambiente: Ambiente,
        mut cancelacion: SenalCancelacion,
    ) -> Result<ResultadoEmision, ErrorSri> {
        if comprobante.estado == EstadoComprobante::Firmado {
            comprobante = self.repo.transicionar(
                comprobante.id,
                EstadoComprobante::Enviado,
                DatosTransicion::default(),
            )?;
        }

        if comprobante.estado == EstadoComprobante::Enviado {
            comprobante = self.recepcion(comprobante, ambiente, &mut cancelacion).await?;
        }

        let tenant = comprobante.tenant.clone();
        let resultado = self.autorizacion(comprobante, ambiente, &mut cancelacion).await?;
        if resultado.autorizado() {
            self.anular_factura_si_corresponde(&tenant, &resultado)?;
        }
        Ok(resultado)
    }

    /// PASO 1: envia a recepcion con reintentos ante fallas de red
    async fn recepcion(
        &self,
        comprobante: Comprobante,
        ambiente: Ambiente,
        cancelacion: &mut SenalCancelacion,
    ) -> Result<Comprobante, ErrorSri> {
        let xml_firmado = comprobante.xml_firmado.clone().ok_or_else(|| ErrorSri::TransicionInvalida {
            desde: comprobante.estado.to_string(),
            hacia: EstadoComprobante::Recibido.to_string(),
        })?;

        let intentos = self.config.esperas_recepcion.len();
        let mut ultimo_error = None;
        let mut respuesta = None;

        for (intento, espera) in self.config.esperas_recepcion.iter().enumerate() {
            if !espera.is_zero() {
                info!(
                    clave_acceso = %comprobante.clave_acceso,
                    "Reintentando recepcion (intento {}/{}) en {}s...",
                    intento + 1,
                    intentos,
                    espera.as_secs()
                );
            }
            cancelacion.esperar(*espera).await?;

            match self.cliente.enviar_comprobante(&xml_firmado, ambiente).await {
                Ok(r) => {
                    respuesta = Some(r);
                    break;
                }
                Err(e @ ErrorSri::Red(_)) => {
                    warn!(clave_acceso = %comprobante.clave_acceso, "Error enviando al SRI (recepcion): {}", e);
                    ultimo_error = Some(e);
                }
                Err(e) => {
                    error!(clave_acceso = %comprobante.clave_acceso, "Recepcion fallida: {}", e);
                    return Err(e);
                }
            }
        }

        let respuesta = match respuesta {
            Some(r) => r,
            None => {
                return Err(ultimo_error
                    .unwrap_or_else(|| ErrorSri::Red("Sin intentos de recepcion configurados".to_string())))
            }
        };

        verificar_clave_respuesta(&comprobante.clave_acceso, respuesta.clave_acceso.as_deref())?;
        self.repo
            .guardar_mensajes(comprobante.id, "RECEPCION", &respuesta.mensajes)?;

        match respuesta.estado {
            EstadoRecepcion::Recibida => {
                info!(clave_acceso = %comprobante.clave_acceso, "Estado recepcion: RECIBIDA");
                self.repo
                    .transicionar(comprobante.id, EstadoComprobante::Recibido, DatosTransicion::default())
            }
            // Error 70 = clave de acceso ya en procesamiento -> saltar a consulta de autorizacion
            EstadoRecepcion::Devuelta if respuesta.clave_en_procesamiento() => {
                info!(clave_acceso = %comprobante.clave_acceso, "Error 70: clave en procesamiento, se consulta autorizacion");
                self.repo.transicionar(
                    comprobante.id,
                    EstadoComprobante::Recibido,
                    DatosTransicion::detalle("Error 70: clave de acceso en procesamiento"),
                )
            }
            EstadoRecepcion::Devuelta => {
                warn!(
                    clave_acceso = %comprobante.clave_acceso,
                    mensajes = respuesta.mensajes.len(),
                    "Comprobante DEVUELTO"
                );
                self.repo.transicionar(
                    comprobante.id,
                    EstadoComprobante::Devuelto,
                    DatosTransicion::detalle(resumen(&respuesta.mensajes)),
                )?;
                Err(ErrorSri::RechazoSri {
                    estado: "DEVUELTA".to_string(),
                    mensajes: respuesta.mensajes,
                })
            }
        }
    }

    /// PASO 2: sondeo de autorizacion con esperas progresivas
    async fn autorizacion(
        &self,
        comprobante: Comprobante,
        ambiente: Ambiente,
        cancelacion: &mut SenalCancelacion,
    ) -> Result<ResultadoEmision, ErrorSri> {
        if comprobante.estado != EstadoComprobante::Recibido {
            return Err(ErrorSri::TransicionInvalida {
                desde: comprobante.estado.to_string(),
                hacia: EstadoComprobante::Autorizado.to_string(),
            });
        }

        let intentos = self.config.esperas_autorizacion.len();
        let mut ultimo_error = None;

        for (intento, espera) in self.config.esperas_autorizacion.iter().enumerate() {
            if !espera.is_zero() {
                info!(
                    clave_acceso = %comprobante.clave_acceso,
                    "Esperando {} segundos antes de reintento {}...",
                    espera.as_secs(),
                    intento + 1
                );
            }
            cancelacion.esperar(*espera).await?;

            info!(clave_acceso = %comprobante.clave_acceso, "Intento autorizacion {}/{}", intento + 1, intentos);
            let respuesta = match self
                .cliente
                .consultar_autorizacion(&comprobante.clave_acceso, ambiente)
                .await
            {
                Ok(r) => r,
                Err(e @ ErrorSri::Red(_)) => {
                    warn!(clave_acceso = %comprobante.clave_acceso, "ERROR autorizacion intento {}: {}", intento + 1, e);
                    ultimo_error = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            ultimo_error = None;
            verificar_clave_respuesta(&comprobante.clave_acceso, respuesta.clave_acceso.as_deref())?;

            match respuesta.estado {
                EstadoAutorizacion::Autorizado => {
                    info!(
                        clave_acceso = %comprobante.clave_acceso,
                        numero_autorizacion = ?respuesta.numero_autorizacion,
                        "AUTORIZADO"
                    );
                    self.repo
                        .guardar_mensajes(comprobante.id, "AUTORIZACION", &respuesta.mensajes)?;
                    let actualizado = self.repo.transicionar(
                        comprobante.id,
                        EstadoComprobante::Autorizado,
                        DatosTransicion {
                            numero_autorizacion: Some(
                                respuesta
                                    .numero_autorizacion
                                    .clone()
                                    .unwrap_or_else(|| comprobante.clave_acceso.to_string()),
                            ),
                            fecha_autorizacion: respuesta.fecha_autorizacion.clone(),
                            ..Default::default()
                        },
                    )?;
                    return Ok(resultado(&actualizado, respuesta.mensajes));
                }
                EstadoAutorizacion::NoAutorizado => {
                    warn!(clave_acceso = %comprobante.clave_acceso, "NO AUTORIZADO: {}", resumen(&respuesta.mensajes));
                    self.repo
                        .guardar_mensajes(comprobante.id, "AUTORIZACION", &respuesta.mensajes)?;
                    self.repo.transicionar(
                        comprobante.id,
                        EstadoComprobante::NoAutorizado,
                        DatosTransicion::detalle(resumen(&respuesta.mensajes)),
                    )?;
                    return Err(ErrorSri::RechazoSri {
                        estado: "NO AUTORIZADO".to_string(),
                        mensajes: respuesta.mensajes,
                    });
                }
                EstadoAutorizacion::EnProceso => {
                    info!(clave_acceso = %comprobante.clave_acceso, "En proceso, reintentando...");
                }
            }
        }

        if let Some(e) = ultimo_error {
            return Err(e);
        }

        // Agotamos reintentos: queda RECIBIDO
        info!(clave_acceso = %comprobante.clave_acceso, "TIMEOUT: Agotamos reintentos, queda EN_PROCESO");
        let mut pendiente = resultado(&comprobante, Vec::new());
        pendiente.mensaje = match ambiente {
            Ambiente::Pruebas => "Comprobante en procesamiento en el SRI (ambiente de pruebas). Reintente mas tarde.",
            Ambiente::Produccion => "El SRI no respondio a tiempo. El comprobante quedo en procesamiento. Reintente mas tarde.",
        }
        .to_string();
        Ok(pendiente)
    }

    /// Suma de notas de credito autorizadas o en curso sobre la factura
    fn valor_acreditado(&self, tenant: &str, factura: &Comprobante) -> Result<f64, ErrorSri> {
        let notas = self.repo.notas_de_factura(tenant, &factura.clave_acceso)?;
        Ok(redondear2(
            notas
                .iter()
                .filter(|n| !matches!(n.estado, EstadoComprobante::Devuelto | EstadoComprobante::NoAutorizado))
                .map(|n| n.importe_total)
                .sum(),
        ))
    }

    /// Una nota de credito autorizada por el total anula su factura
    fn anular_factura_si_corresponde(&self, tenant: &str, resultado: &ResultadoEmision) -> Result<(), ErrorSri> {
        if resultado.clave_acceso.cod_doc() != TipoComprobante::NotaCredito.codigo() {
            return Ok(());
        }
        let nota = self.consultar(tenant, &resultado.clave_acceso)?;
        let clave_factura = match nota.documento_modificado {
            Some(ref clave) => clave.clone(),
            None => return Ok(()),
        };
        let factura = match self.repo.buscar_por_clave(tenant, &clave_factura)? {
            Some(f) => f,
            None => {
                warn!(factura = %clave_factura, "Factura de la nota de credito no encontrada");
                return Ok(());
            }
        };

        if factura.estado != EstadoComprobante::Autorizado {
            return Ok(());
        }
        if (nota.importe_total - factura.importe_total).abs() > TOLERANCIA {
            info!(
                factura = %factura.clave_acceso,
                nota = %nota.clave_acceso,
                "Nota de credito parcial, la factura sigue AUTORIZADA"
            );
            return Ok(());
        }

        let evidencia = EvidenciaAnulacion::desde_nota_credito(&nota, &factura)?;
        self.repo.anular(factura.id, &evidencia)?;
        info!(factura = %factura.clave_acceso, nota = %nota.clave_acceso, "Factura ANULADA");
        Ok(())
    }
}

fn resultado(comprobante: &Comprobante, mensajes: Vec<MensajeSri>) -> ResultadoEmision {
    let mensaje = match comprobante.estado {
        EstadoComprobante::Autorizado => match comprobante.tipo {
            TipoComprobante::Factura => "Factura autorizada correctamente",
            TipoComprobante::NotaCredito => "Nota de credito autorizada correctamente",
        },
        _ => "Comprobante aun en procesamiento",
    };
    ResultadoEmision {
        comprobante_id: comprobante.id,
        clave_acceso: comprobante.clave_acceso.clone(),
        numero: comprobante.numero.clone(),
        estado: comprobante.estado,
        numero_autorizacion: comprobante.numero_autorizacion.clone(),
        fecha_autorizacion: comprobante.fecha_autorizacion.clone(),
        mensajes,
        mensaje: mensaje.to_string(),
    }
}

/// Una respuesta que nombra otra clave no se aplica al comprobante
fn verificar_clave_respuesta(esperada: &ClaveAcceso, recibida: Option<&str>) -> Result<(), ErrorSri> {
    match recibida {
        Some(clave) if clave.trim() != esperada.as_str() => {
            error!(clave_acceso = %esperada, clave_respuesta = clave, "Respuesta del SRI para otra clave");
            Err(ErrorSri::Protocolo(format!(
                "El SRI respondio por la clave {} y se consulto {}",
                clave.trim(),
                esperada
            )))
        }
        _ => Ok(()),
    }
}

fn resumen(mensajes: &[MensajeSri]) -> String {
    mensajes
        .iter()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join(" | ")
}
