use std::io::{self, Write};

/// Fixed prefix identifying lines produced by this evaluator.
pub const RESULT_PREFIX: &str = "Parasweep";

/// Writes one flushed line per completed evaluation request.
pub struct ResultEmitter<W: Write> {
    out: W,
    prefix: &'static str,
    lines: usize,
}

impl<W: Write> ResultEmitter<W> {
    pub fn new(out: W) -> Self {
        Self::with_prefix(out, RESULT_PREFIX)
    }

    pub fn with_prefix(out: W, prefix: &'static str) -> Self {
        Self {
            out,
            prefix,
            lines: 0,
        }
    }

    /// `<prefix>_RESULT:<id>:<value>`.
    pub fn emit_value(
        &mut self,
        identifier: &str,
        value: f64,
        output_precision: Option<usize>,
    ) -> io::Result<()> {
        let rendered = render_value(value, output_precision);
        self.write_line(identifier, &rendered)
    }

    /// `<prefix>_RESULT:<id>:ERROR <message>`, folded onto a single line.
    pub fn emit_error(&mut self, identifier: &str, message: &str) -> io::Result<()> {
        let folded = message.split_whitespace().collect::<Vec<_>>().join(" ");
        self.write_line(identifier, &format!("ERROR {}", folded))
    }

    /// Number of lines written so far.
    pub fn lines(&self) -> usize {
        self.lines
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_line(&mut self, identifier: &str, payload: &str) -> io::Result<()> {
        writeln!(self.out, "{}_RESULT:{}:{}", self.prefix, identifier, payload)?;
        self.out.flush()?;
        self.lines += 1;
        Ok(())
    }
}

/// Shortest round-trip representation by default; `inf` for infinite values.
pub fn render_value(value: f64, output_precision: Option<usize>) -> String {
    match output_precision {
        _ if value.is_infinite() => if value > 0.0 { "inf" } else { "-inf" }.to_string(),
        Some(digits) => format!("{:.*}", digits, value),
        None => format!("{}", value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(emitter: ResultEmitter<Vec<u8>>) -> String {
        String::from_utf8(emitter.into_inner()).expect("utf-8")
    }

    #[test]
    fn renders_values_and_errors() {
        let mut emitter = ResultEmitter::new(Vec::new());
        emitter.emit_value("1", 0.25, None).expect("write");
        emitter.emit_value("2", 1.0 / 3.0, Some(4)).expect("write");
        emitter.emit_value("x", f64::INFINITY, Some(2)).expect("write");
        emitter
            .emit_error("3", "invalid value `abc`\n  for parameter `p`")
            .expect("write");
        assert_eq!(emitter.lines(), 4);
        assert_eq!(
            output(emitter),
            "Parasweep_RESULT:1:0.25\n\
             Parasweep_RESULT:2:0.3333\n\
             Parasweep_RESULT:x:inf\n\
             Parasweep_RESULT:3:ERROR invalid value `abc` for parameter `p`\n"
        );
    }

    #[test]
    fn whole_numbers_render_without_fraction() {
        assert_eq!(render_value(1.0, None), "1");
        assert_eq!(render_value(0.0, Some(0)), "0");
        assert_eq!(render_value(1e-7, None), "0.0000001");
    }

    #[test]
    fn custom_prefix() {
        let mut emitter = ResultEmitter::with_prefix(Vec::new(), "Sweep");
        emitter.emit_value("7", 0.5, None).expect("write");
        assert_eq!(output(emitter), "Sweep_RESULT:7:0.5\n");
    }
}
