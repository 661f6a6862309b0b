pub mod cancelacion;
pub mod estados;
pub mod orquestador;
pub mod repositorio;
pub mod secuencial;

pub use cancelacion::{canal, Cancelador, SenalCancelacion};
pub use estados::{EvidenciaAnulacion, MaquinaEstados};
pub use orquestador::{CredencialFirma, Orquestador, ResultadoEmision};
pub use repositorio::RepositorioComprobantes;
pub use secuencial::{ContadorSecuencial, ContadorSqlite, HuecoSecuencial};
