use std::io::{Error, Seek, Write};
use zip::ZipWriter;

pub trait Finish<O> {
    fn finish(self) -> Result<O, Error>;
}

impl<W: Write + Seek> Finish<W> for ZipWriter<W> {
    /// Writes the central directory and hands back the underlying writer.
    fn finish(self) -> Result<W, Error> {
        ZipWriter::finish(self).map_err(|e| match e {
            zip::result::ZipError::Io(e) => e,
            e => Error::other(e),
        })
    }
}
