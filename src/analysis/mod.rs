pub mod cfg;
pub mod clang;
pub mod tags;

use std::path::Path;

use eyre::Result;

use crate::gadget::{ApiGadget, TypeGadget};

/// One step of a critical path: the resolved callee name and the 1-based
/// source line of the call, if known.
pub type PathStep = (String, Option<u32>);

/// A maximal call sequence through the harness entry function.
pub type CriticalPath = Vec<PathStep>;

/// Static analysis capabilities the engine relies on.
///
/// Language plug-ins provide concrete implementations; the pipeline only ever
/// talks to this trait.
pub trait AstParser {
    /// Parse the API gadgets declared in the given source file.
    fn parse_api_gadget(&self, source: &Path) -> Result<Vec<ApiGadget>>;

    /// Parse the user-declared type gadgets of the given source file.
    fn parse_type_gadget(&self, source: &Path) -> Result<Vec<TypeGadget>>;

    /// Extract all maximal call paths through the control-flow graph of
    /// `target` (the fuzzer entry function when `None`), restricted to calls
    /// of `gadgets` when non-empty.
    fn extract_critical_path(
        &self,
        source: &Path,
        gadgets: &[ApiGadget],
        target: Option<&str>,
    ) -> Result<Vec<CriticalPath>>;
}

/// Types whose name equals the API's return type or any argument type.
pub fn retrieve_type<'t>(api: &ApiGadget, types: &'t [TypeGadget]) -> Vec<&'t TypeGadget> {
    types
        .iter()
        .filter(|gadget| {
            api.return_type == gadget.name
                || api.arguments.iter().any(|(_, type_)| *type_ == gadget.name)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gadget::TypeTag;

    #[test]
    fn test_retrieve_type() {
        let api = ApiGadget::new(
            "deflateInit",
            "int",
            vec![(Some("strm".into()), "z_stream".into())],
        );
        let types = vec![
            TypeGadget::new("z_stream", TypeTag::Struct, None),
            TypeGadget::new("gz_header", TypeTag::Struct, None),
            TypeGadget::new("int", TypeTag::Alias, Some("int32_t")),
        ];
        let found = retrieve_type(&api, &types);
        let names: Vec<_> = found.iter().map(|gadget| gadget.name.as_str()).collect();
        assert_eq!(names, ["z_stream", "int"]);
    }
}
