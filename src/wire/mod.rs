pub mod codec;
pub mod decode;
pub mod keytable;
pub mod protocol;
