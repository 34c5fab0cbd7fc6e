use std::fs;
use std::path::Path;
use tracing::{debug, error};

use crate::error::InstructionError;

/// Ordered mapping of derived-column name to expression source.
///
/// Later entries may reference earlier ones, so insertion order matters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Instruction {
    entries: Vec<(String, String)>,
}

impl Instruction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, N, E>(pairs: I) -> Result<Self, InstructionError>
    where
        I: IntoIterator<Item = (N, E)>,
        N: Into<String>,
        E: Into<String>,
    {
        let mut instruction = Self::new();
        for (name, expression) in pairs {
            instruction.push(name, expression)?;
        }
        Ok(instruction)
    }

    pub fn push(&mut self, name: impl Into<String>, expression: impl Into<String>) -> Result<(), InstructionError> {
        let name = name.into();
        if self.get(&name).is_some() {
            return Err(InstructionError::DuplicateName(name));
        }
        self.entries.push((name, expression.into()));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, expression)| expression.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, expression)| (name.as_str(), expression.as_str()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Read a headerless two-column `name,expression` CSV file.
pub fn load_instruction(path: impl AsRef<Path>) -> Result<Instruction, InstructionError> {
    let path = path.as_ref();
    let result = fs::read_to_string(path)
        .map_err(InstructionError::from)
        .and_then(|content| parse_instruction(&content));

    match &result {
        Ok(instruction) => debug!("Loaded {} instruction entries from {}", instruction.len(), path.display()),
        Err(e) => error!("Failed to load instruction from {}: {}", path.display(), e),
    }
    result
}

/// Write one `name,expression` row per entry, in insertion order.
pub fn save_instruction(path: impl AsRef<Path>, instruction: &Instruction) -> Result<(), InstructionError> {
    let path = path.as_ref();
    let mut content = String::new();
    for (name, expression) in instruction.iter() {
        content.push_str(&quote_field(name));
        content.push(',');
        content.push_str(&quote_field(expression));
        content.push_str("\r\n");
    }

    let result = fs::write(path, content).map_err(InstructionError::from);
    match &result {
        Ok(()) => debug!("Saved {} instruction entries to {}", instruction.len(), path.display()),
        Err(e) => error!("Failed to save instruction to {}: {}", path.display(), e),
    }
    result
}

fn quote_field(field: &str) -> String {
    if field.contains(&[',', '"', '\n', '\r'][..]) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn parse_instruction(content: &str) -> Result<Instruction, InstructionError> {
    let mut instruction = Instruction::new();
    for (line, fields) in parse_records(content)? {
        match <[String; 2]>::try_from(fields) {
            Ok([name, expression]) => instruction.push(name, expression)?,
            Err(fields) => {
                return Err(InstructionError::Malformed {
                    line,
                    fields: fields.len(),
                })
            }
        }
    }
    Ok(instruction)
}

/// RFC 4180 records paired with the 1-based line each one starts on.
/// Blank lines are skipped.
fn parse_records(content: &str) -> Result<Vec<(usize, Vec<String>)>, InstructionError> {
    let mut records = Vec::new();
    let mut chars = content.chars().peekable();
    let mut line = 1;

    while chars.peek().is_some() {
        let start_line = line;
        let mut fields = Vec::new();
        let mut field = String::new();
        let mut quoted_field = false;

        loop {
            match chars.next() {
                None => {
                    fields.push(std::mem::take(&mut field));
                    break;
                }
                Some('"') if field.is_empty() && !quoted_field => {
                    quoted_field = true;
                    loop {
                        match chars.next() {
                            None => return Err(InstructionError::UnterminatedQuote(start_line)),
                            Some('"') if chars.peek() == Some(&'"') => {
                                chars.next();
                                field.push('"');
                            }
                            Some('"') => break,
                            Some(c) => {
                                if c == '\n' {
                                    line += 1;
                                }
                                field.push(c);
                            }
                        }
                    }
                }
                Some(',') => {
                    fields.push(std::mem::take(&mut field));
                    quoted_field = false;
                }
                Some('\r') if chars.peek() == Some(&'\n') => {}
                Some('\n') => {
                    line += 1;
                    fields.push(std::mem::take(&mut field));
                    break;
                }
                Some(c) => field.push(c),
            }
        }

        let blank = fields.len() == 1 && fields[0].is_empty() && !quoted_field;
        if !blank {
            records.push((start_line, fields));
        }
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trip_keeps_order_and_delimiters() {
        let instruction = Instruction::from_pairs([
            ("px2", "px*px"),
            ("lead", "max(pt[0], 1.0)"),
            ("quoted", "x > 0 ? \"a\" : 0"),
            ("energy", "sqrt(px2+py2+pz2)"),
        ])
        .unwrap();
        let dir = tempdir().unwrap();
        let path = dir.path().join("instruction.csv");

        save_instruction(&path, &instruction).unwrap();
        let loaded = load_instruction(&path).unwrap();

        assert_eq!(loaded, instruction);
        assert_eq!(loaded.names(), vec!["px2", "lead", "quoted", "energy"]);
    }

    #[test]
    fn single_field_row_is_malformed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.csv");
        fs::write(&path, "a,x+1\nbroken\n").unwrap();

        let result = load_instruction(&path);
        assert!(matches!(result, Err(InstructionError::Malformed { line: 2, fields: 1 })));
    }

    #[test]
    fn missing_file_differs_from_empty_instruction() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.csv");
        assert!(matches!(load_instruction(&path), Err(InstructionError::Io(_))));

        fs::write(&path, "").unwrap();
        assert!(load_instruction(&path).unwrap().is_empty());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut instruction = Instruction::new();
        instruction.push("a", "1").unwrap();
        assert!(matches!(instruction.push("a", "2"), Err(InstructionError::DuplicateName(_))));
        assert!(matches!(
            parse_instruction("a,1\na,2\n"),
            Err(InstructionError::DuplicateName(_))
        ));
    }

    #[test]
    fn unterminated_quote_is_reported() {
        assert!(matches!(
            parse_instruction("a,\"x +\n1\n"),
            Err(InstructionError::UnterminatedQuote(1))
        ));
    }
}
