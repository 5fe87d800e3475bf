use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A callable surface point of the target library.
///
/// The rendered `signature()` is the global identity key: two gadgets are the
/// same API iff their signatures are equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiGadget {
    pub name: String,
    pub return_type: String,
    /// Ordered `(parameter name, type)` pairs; the name is optional for
    /// unnamed parameters and the variadic `...` tail.
    pub arguments: Vec<(Option<String>, String)>,
    /// Opaque origin info (source path, AST node kind, post qualifiers).
    #[serde(default)]
    pub meta: HashMap<String, String>,
    /// Signature cache carried through dump/load.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
}

impl ApiGadget {
    pub fn new(name: &str, return_type: &str, arguments: Vec<(Option<String>, String)>) -> Self {
        Self {
            name: name.to_string(),
            return_type: return_type.to_string(),
            arguments,
            meta: HashMap::new(),
            signature: None,
        }
    }

    pub fn with_meta(mut self, key: &str, value: &str) -> Self {
        self.meta.insert(key.to_string(), value.to_string());
        self
    }

    /// Render into a C-style single-line declaration.
    pub fn signature(&self) -> String {
        if let Some(cached) = &self.signature {
            return cached.clone();
        }
        let args = self
            .arguments
            .iter()
            .map(|(name, type_)| match name {
                Some(name) => format!("{type_} {name}"),
                None => type_.clone(),
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("{} {}({})", self.return_type, self.name, args)
    }

    /// Freeze the rendered signature so it survives serialization.
    pub fn sealed(mut self) -> Self {
        self.signature = Some(self.signature());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeTag {
    Alias,
    Struct,
    Class,
}

/// A user-declared type of the target library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeGadget {
    pub name: String,
    pub tag: TypeTag,
    /// Underlying type for aliases, e.g. `struct cJSON` of
    /// `typedef struct cJSON cJSON;`.
    pub qualified: Option<String>,
    #[serde(default)]
    pub meta: HashMap<String, String>,
}

impl TypeGadget {
    pub fn new(name: &str, tag: TypeTag, qualified: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            tag,
            qualified: qualified.map(str::to_string),
            meta: HashMap::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: &str) -> Self {
        self.meta.insert(key.to_string(), value.to_string());
        self
    }

    pub fn signature(&self) -> String {
        match self.tag {
            TypeTag::Alias => {
                let qualified = self.qualified.as_deref().unwrap_or("void");
                // `using` for C++ alias declarations, `typedef` otherwise
                if self.meta.get("kind").map(String::as_str) == Some("TypeAliasDecl") {
                    format!("using {} = {};", self.name, qualified)
                } else {
                    format!("typedef {} {};", qualified, self.name)
                }
            }
            TypeTag::Struct => format!("struct {};", self.name),
            TypeTag::Class => format!("class {};", self.name),
        }
    }
}
