//! The fixed set of capabilities a script may reach.
//!
//! One table, built on first use and shared read-only by every evaluation in
//! the process. Nothing is configurable per request.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use rhai::packages::{
    BasicArrayPackage, BasicMapPackage, BasicMathPackage, BitFieldPackage, CorePackage,
    LogicPackage, MoreStringPackage, Package,
};
use rhai::{
    AST, ASTNode, Array, Dynamic, Engine, EvalAltResult, ImmutableString, Module, ModuleResolver,
    Position, Shared, Stmt,
};

use crate::builtins;

/// A name the allowlist refused to resolve.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("use of '{name}' is not allowed")]
pub struct CapabilityDenied {
    pub name: String,
}

impl CapabilityDenied {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Wrap as a script error so the engine unwinds with it intact.
    pub fn into_eval_error(self, pos: Position) -> Box<EvalAltResult> {
        EvalAltResult::ErrorRuntime(Dynamic::from(self), pos).into()
    }
}

/// An extra built-in function family.
pub struct Builtin {
    pub name: &'static str,
    register: fn(&mut Engine),
}

impl Builtin {
    pub fn register(&self, engine: &mut Engine) {
        (self.register)(engine);
    }
}

type SharedModule = Shared<Module>;
type PackageFn = fn() -> SharedModule;
type ModuleFn = fn() -> Module;

pub struct CapabilityAllowlist {
    packages: Vec<(&'static str, PackageFn)>,
    builtins: BTreeMap<&'static str, Builtin>,
    modules: BTreeMap<&'static str, ModuleFn>,
    deny_list: BTreeSet<&'static str>,
    disabled_symbols: Vec<&'static str>,
}

static ALLOWLIST: LazyLock<CapabilityAllowlist> = LazyLock::new(CapabilityAllowlist::build);

/// The process-wide allowlist.
pub fn allowlist() -> &'static CapabilityAllowlist {
    &ALLOWLIST
}

const DENY_LIST: &[&str] = &[
    "os",
    "sys",
    "subprocess",
    "shutil",
    "builtins",
    "pathlib",
    "importlib",
    "socket",
    "net",
    "http",
    "fs",
    "file",
    "process",
    "env",
    "system",
    "exec",
    "spawn",
    "thread",
    "eval",
];

impl CapabilityAllowlist {
    fn build() -> Self {
        let packages: Vec<(&'static str, PackageFn)> = vec![
            ("core", || CorePackage::new().as_shared_module()),
            ("logic", || LogicPackage::new().as_shared_module()),
            ("math", || BasicMathPackage::new().as_shared_module()),
            ("array", || BasicArrayPackage::new().as_shared_module()),
            ("map", || BasicMapPackage::new().as_shared_module()),
            ("string", || MoreStringPackage::new().as_shared_module()),
            ("bit_field", || BitFieldPackage::new().as_shared_module()),
        ];

        let builtins = [
            ("str", builtins::register_str as fn(&mut Engine)),
            ("int", builtins::register_int),
            ("float", builtins::register_float),
            ("bool", builtins::register_bool),
            ("sum", builtins::register_sum),
            ("sorted", builtins::register_sorted),
            ("enumerate", builtins::register_enumerate),
            ("zip", builtins::register_zip),
        ]
        .into_iter()
        .map(|(name, register)| (name, Builtin { name, register }))
        .collect();

        let mut modules: BTreeMap<&'static str, ModuleFn> = BTreeMap::new();
        modules.insert("math", math_module);
        modules.insert("text", text_module);

        Self {
            packages,
            builtins,
            modules,
            deny_list: DENY_LIST.iter().copied().collect(),
            disabled_symbols: vec!["eval"],
        }
    }

    pub fn is_denied(&self, name: &str) -> bool {
        self.deny_list.contains(name)
    }

    pub fn package_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.packages.iter().map(|(name, _)| *name)
    }

    pub fn module_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.modules.keys().copied()
    }

    pub fn resolve_builtin(&self, name: &str) -> Result<&Builtin, CapabilityDenied> {
        if self.is_denied(name) {
            return Err(CapabilityDenied::new(name));
        }
        self.builtins
            .get(name)
            .ok_or_else(|| CapabilityDenied::new(name))
    }

    /// Resolve `module` for an import. `names` are the other identifiers the
    /// import mentions; any deny-listed one refuses the whole import.
    pub fn resolve_import(&self, module: &str, names: &[&str]) -> Result<Module, CapabilityDenied> {
        if self.is_denied(module) {
            return Err(CapabilityDenied::new(module));
        }
        if let Some(name) = names.iter().find(|n| self.is_denied(n)) {
            return Err(CapabilityDenied::new(*name));
        }
        let build = self
            .modules
            .get(module)
            .ok_or_else(|| CapabilityDenied::new(module))?;
        let mut module = build();
        module.build_index();
        Ok(module)
    }

    /// Refuse any `import ... as <alias>` whose alias is deny-listed.
    ///
    /// The module resolver only sees the path, so aliases are checked on the
    /// compiled AST before anything runs, function bodies included.
    pub fn check_import_aliases(&self, ast: &AST) -> Result<(), Box<EvalAltResult>> {
        let mut denied = None;
        let _ = ast.walk(&mut |path: &[ASTNode]| {
            if let Some(ASTNode::Stmt(Stmt::Import(import, pos))) = path.last() {
                let alias = import.1.name.as_str();
                if self.is_denied(alias) {
                    denied = Some(CapabilityDenied::new(alias).into_eval_error(*pos));
                    return false;
                }
            }
            true
        });
        denied.map_or(Ok(()), Err)
    }

    /// Apply the whole table to a fresh engine.
    pub fn install(&'static self, engine: &mut Engine) {
        for (_, package) in &self.packages {
            engine.register_global_module(package());
        }
        for name in self.builtins.keys() {
            if let Ok(builtin) = self.resolve_builtin(name) {
                builtin.register(engine);
            }
        }
        for symbol in &self.disabled_symbols {
            engine.disable_symbol(*symbol);
        }
        engine.set_module_resolver(AllowlistResolver { allowlist: self });
        #[allow(deprecated)]
        engine.on_var(move |name, _index, context| {
            if self.is_denied(name) && !context.scope().contains(name) {
                return Err(CapabilityDenied::new(name).into_eval_error(Position::NONE));
            }
            Ok(None)
        });
    }
}

/// Routes every `import` through the allowlist.
struct AllowlistResolver {
    allowlist: &'static CapabilityAllowlist,
}

impl ModuleResolver for AllowlistResolver {
    fn resolve(
        &self,
        _engine: &Engine,
        _source: Option<&str>,
        path: &str,
        pos: Position,
    ) -> Result<SharedModule, Box<EvalAltResult>> {
        let segments: Vec<&str> = path
            .split(['/', '.', ':'])
            .filter(|s| !s.is_empty())
            .collect();
        match self.allowlist.resolve_import(path, &segments) {
            Ok(module) => {
                tracing::debug!(module = path, "import resolved");
                Ok(module.into())
            }
            Err(denied) => {
                tracing::debug!(module = path, "import denied");
                Err(denied.into_eval_error(pos))
            }
        }
    }
}

fn math_module() -> Module {
    let mut m = Module::new();
    m.set_var("PI", std::f64::consts::PI);
    m.set_var("E", std::f64::consts::E);
    m.set_native_fn("sqrt", |x: rhai::FLOAT| Ok(x.sqrt()));
    m.set_native_fn("sqrt", |x: rhai::INT| Ok((x as rhai::FLOAT).sqrt()));
    m.set_native_fn("pow", |x: rhai::FLOAT, y: rhai::FLOAT| Ok(x.powf(y)));
    m.set_native_fn("floor", |x: rhai::FLOAT| Ok(x.floor() as rhai::INT));
    m.set_native_fn("ceil", |x: rhai::FLOAT| Ok(x.ceil() as rhai::INT));
    m.set_native_fn("abs", |x: rhai::INT| Ok(x.wrapping_abs()));
    m.set_native_fn("abs", |x: rhai::FLOAT| Ok(x.abs()));
    m.set_native_fn("min", |a: rhai::INT, b: rhai::INT| Ok(a.min(b)));
    m.set_native_fn("max", |a: rhai::INT, b: rhai::INT| Ok(a.max(b)));
    m.set_native_fn("gcd", |a: rhai::INT, b: rhai::INT| {
        let (mut a, mut b) = (a.wrapping_abs(), b.wrapping_abs());
        while b != 0 {
            (a, b) = (b, a % b);
        }
        Ok(a)
    });
    m
}

fn text_module() -> Module {
    let mut m = Module::new();
    m.set_native_fn("upper", |s: ImmutableString| Ok(s.to_uppercase()));
    m.set_native_fn("lower", |s: ImmutableString| Ok(s.to_lowercase()));
    m.set_native_fn("reverse", |s: ImmutableString| {
        Ok(s.chars().rev().collect::<String>())
    });
    m.set_native_fn("title", |s: ImmutableString| {
        let titled = s
            .split(' ')
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first
                        .to_uppercase()
                        .chain(chars.flat_map(char::to_lowercase))
                        .collect(),
                    None => String::new(),
                }
            })
            .collect::<Vec<String>>()
            .join(" ");
        Ok(titled)
    });
    m.set_native_fn("words", |s: ImmutableString| {
        Ok(s.split_whitespace()
            .map(|w| Dynamic::from(w.to_owned()))
            .collect::<Array>())
    });
    m.set_native_fn("join", |items: Array, sep: ImmutableString| {
        Ok(items
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(sep.as_str()))
    });
    m
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deny_list_wins_over_everything() {
        let list = allowlist();
        for name in ["os", "socket", "subprocess", "eval", "system"] {
            assert!(list.is_denied(name), "{name} should be denied");
        }
        assert!(!list.is_denied("math"));
    }

    #[test]
    fn builtins_resolve() {
        let list = allowlist();
        assert_eq!(list.resolve_builtin("sum").unwrap().name, "sum");
        assert_eq!(
            list.resolve_builtin("exec").err(),
            Some(CapabilityDenied::new("exec"))
        );
        assert!(list.resolve_builtin("open").is_err());
    }

    #[test]
    fn imports_resolve_only_known_modules() {
        let list = allowlist();
        assert!(list.resolve_import("math", &["math"]).is_ok());
        assert!(list.resolve_import("text", &[]).is_ok());

        let err = list.resolve_import("socket", &["socket"]).unwrap_err();
        assert_eq!(err.to_string(), "use of 'socket' is not allowed");
        assert!(list.resolve_import("yaml", &[]).is_err());
    }

    #[test]
    fn denied_segment_refuses_import() {
        let err = allowlist().resolve_import("math", &["math", "os"]).unwrap_err();
        assert_eq!(err.name, "os");
    }

    #[test]
    fn table_is_fixed() {
        let list = allowlist();
        assert_eq!(list.module_names().collect::<Vec<_>>(), vec!["math", "text"]);
        assert!(list.package_names().any(|p| p == "core"));
        assert!(!list.package_names().any(|p| p == "time"));
    }

    #[test]
    fn denied_alias_refuses_import() {
        let mut engine = Engine::new_raw();
        allowlist().install(&mut engine);

        let ast = engine.compile(r#"import "math" as os; os::sqrt(16.0)"#).unwrap();
        let err = allowlist().check_import_aliases(&ast).unwrap_err();
        let denied = match *err {
            EvalAltResult::ErrorRuntime(value, _) => value.try_cast::<CapabilityDenied>(),
            _ => None,
        };
        assert_eq!(denied, Some(CapabilityDenied::new("os")));

        let nested = engine
            .compile(r#"fn main() { import "text" as sys; 1 }"#)
            .unwrap();
        assert!(allowlist().check_import_aliases(&nested).is_err());

        let fine = engine.compile(r#"import "math" as m; m::sqrt(4.0)"#).unwrap();
        assert!(allowlist().check_import_aliases(&fine).is_ok());
    }

    #[test]
    fn installed_engine_runs_module_functions() {
        let mut engine = Engine::new_raw();
        allowlist().install(&mut engine);
        let out = engine
            .eval::<String>(r#"import "text" as t; import "math" as m; t::upper("ab") + m::gcd(12, 18)"#)
            .unwrap();
        assert_eq!(out, "AB6");
    }
}
