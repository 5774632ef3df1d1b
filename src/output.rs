use std::io::{self, Write};

use serde::Serialize;

/// Потоковая запись в формате JSONL (JSON Lines).
/// - Одна запись - один JSON-объект
/// - Каждый объект заканчивается '\n'
pub struct JsonlWriter<W: Write> {
    inner: W,
    written: u64,
}

impl<W: Write> JsonlWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }

    pub fn write<T: Serialize>(&mut self, value: &T) -> io::Result<()> {
        serde_json::to_writer(&mut self.inner, value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.inner.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    pub fn write_all<T, I>(&mut self, values: I) -> io::Result<()>
    where
        T: Serialize,
        I: IntoIterator<Item = T>,
    {
        for value in values {
            self.write(&value)?;
        }
        Ok(())
    }

    /// Сколько строк уже записано.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    #[serde(rename_all = "PascalCase")]
    struct Row {
        entry_number: u64,
        file_name: &'static str,
    }

    #[test]
    fn one_object_per_line() {
        let mut writer = JsonlWriter::new(Vec::new());
        writer
            .write_all([
                Row {
                    entry_number: 5,
                    file_name: "notes.txt",
                },
                Row {
                    entry_number: 6,
                    file_name: "a\nb",
                },
            ])
            .unwrap();
        assert_eq!(writer.written(), 2);
        let text = String::from_utf8(writer.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"{"EntryNumber":5,"FileName":"notes.txt"}"#);
        assert_eq!(lines[1], r#"{"EntryNumber":6,"FileName":"a\nb"}"#);
    }
}
