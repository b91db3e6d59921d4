use crate::dialect::Dialect;
use serde_json::Value;

/// Logical identity of a bind value: statement sequence index plus column
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParamKey {
    pub index: usize,
    pub column: String,
}

/// One bind slot of a statement
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterEntry {
    pub key: ParamKey,
    pub value: Value,
    /// Stable name, unique across a batch (`p{index}_{column}`, suffixed
    /// with `_{n}` when that is already taken)
    pub name: String,
    /// Text emitted into the SQL for this slot
    pub placeholder: String,
    /// 1-based bind position
    pub ordinal: usize,
}

/// Per-statement parameter registry.
///
/// Constants that share a logical key and value bind once, so
/// `a.X == 5 AND b.X == 5` produces a single entry.
#[derive(Debug, Clone, Default)]
pub struct ParamTable {
    index: usize,
    entries: Vec<ParameterEntry>,
}

impl ParamTable {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            entries: Vec::new(),
        }
    }

    /// Sequence index of the statement this table belongs to.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn create_param(
        &mut self,
        dialect: &dyn Dialect,
        column: &str,
        value: Value,
    ) -> &ParameterEntry {
        let key = ParamKey {
            index: self.index,
            column: column.to_string(),
        };

        let mut same_key = 0;
        let mut found = None;
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.key == key {
                if entry.value == value {
                    found = Some(i);
                    break;
                }
                same_key += 1;
            }
        }

        let position = match found {
            Some(i) => i,
            None => {
                let base = format!("p{}_{}", self.index, sanitize(column));
                let mut suffix = same_key;
                let mut name = if suffix > 0 {
                    format!("{}_{}", base, suffix)
                } else {
                    base.clone()
                };
                // Sanitizing and suffixing can both land on a name already taken.
                while self.entries.iter().any(|e| e.name == name) {
                    suffix += 1;
                    name = format!("{}_{}", base, suffix);
                }
                let ordinal = self.entries.len() + 1;
                let placeholder = dialect.placeholder(&name, ordinal);

                self.entries.push(ParameterEntry {
                    key,
                    value,
                    name,
                    placeholder,
                    ordinal,
                });
                self.entries.len() - 1
            }
        };

        &self.entries[position]
    }

    pub fn entries(&self) -> &[ParameterEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_entries(self) -> Vec<ParameterEntry> {
        self.entries
    }
}

fn sanitize(column: &str) -> String {
    column
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{Postgres, SqlServer};

    #[test]
    fn test_same_key_same_value_binds_once() {
        let mut table = ParamTable::new(0);

        let first = table.create_param(&SqlServer, "LoginCount", Value::from(5)).clone();
        let second = table.create_param(&SqlServer, "LoginCount", Value::from(5)).clone();

        assert_eq!(first, second);
        assert_eq!(table.len(), 1);
        assert_eq!(first.placeholder, "@p0_LoginCount");
    }

    #[test]
    fn test_same_key_different_value_is_disambiguated() {
        let mut table = ParamTable::new(2);

        table.create_param(&SqlServer, "ID", Value::from(5));
        let other = table.create_param(&SqlServer, "ID", Value::from(6)).clone();

        assert_eq!(table.len(), 2);
        assert_eq!(other.name, "p2_ID_1");
        assert_eq!(other.ordinal, 2);
    }

    #[test]
    fn test_names_never_collide() {
        let mut table = ParamTable::new(0);

        table.create_param(&SqlServer, "ID", Value::from(5));
        table.create_param(&SqlServer, "ID", Value::from(6));
        table.create_param(&SqlServer, "ID_1", Value::from(7));
        table.create_param(&SqlServer, "a b", Value::from(8));
        table.create_param(&SqlServer, "a_b", Value::from(9));

        let names: Vec<&str> = table.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["p0_ID", "p0_ID_1", "p0_ID_1_1", "p0_a_b", "p0_a_b_1"]);

        let placeholders: std::collections::HashSet<&str> = table
            .entries()
            .iter()
            .map(|e| e.placeholder.as_str())
            .collect();
        assert_eq!(placeholders.len(), 5);

        // Still deduplicated by key and value
        let again = table.create_param(&SqlServer, "ID_1", Value::from(7)).clone();
        assert_eq!(again.name, "p0_ID_1_1");
        assert_eq!(table.len(), 5);
    }

    #[test]
    fn test_positional_placeholders() {
        let mut table = ParamTable::new(1);

        table.create_param(&Postgres, "a", Value::from(1));
        table.create_param(&Postgres, "getdate()", Value::from(2));

        let entries = table.entries();
        assert_eq!(entries[0].placeholder, "$1");
        assert_eq!(entries[1].placeholder, "$2");
        assert_eq!(entries[1].name, "p1_getdate__");
    }
}
