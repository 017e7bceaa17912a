pub const KEYWORDS: &[&str] = &[
    "assert", "each", "echo", "else", "for", "function", "if", "include", "let", "module", "use",
];

pub const SYMBOLS_2: &[([char; 2], &str)] = &[
    (['=', '='], "=="),
    (['!', '='], "!="),
    (['<', '='], "<="),
    (['>', '='], ">="),
    (['&', '&'], "&&"),
    (['|', '|'], "||"),
];

pub const SYMBOLS_1: &[char] = &[
    '{', '}', '(', ')', '[', ']', ';', ',', ':', '?', '=', '!', '<', '>', '+', '-', '*', '/', '%',
    '^', '.', '#',
];

/// Module names that bind their named arguments as loop/let variables in the
/// child statement rather than passing them to a definition.
pub const BINDER_MODULES: &[&str] = &["for", "intersection_for", "let"];

pub const BUILTIN_MODULES: &[&str] = &[
    "children",
    "circle",
    "color",
    "cube",
    "cylinder",
    "difference",
    "group",
    "hull",
    "import",
    "intersection",
    "intersection_for",
    "linear_extrude",
    "minkowski",
    "mirror",
    "multmatrix",
    "offset",
    "polygon",
    "polyhedron",
    "projection",
    "render",
    "resize",
    "rotate",
    "rotate_extrude",
    "scale",
    "sphere",
    "square",
    "surface",
    "text",
    "translate",
    "union",
];

pub const BUILTIN_FUNCTIONS: &[&str] = &[
    "abs",
    "acos",
    "asin",
    "atan",
    "atan2",
    "ceil",
    "chr",
    "concat",
    "cos",
    "cross",
    "exp",
    "floor",
    "is_bool",
    "is_function",
    "is_list",
    "is_num",
    "is_string",
    "is_undef",
    "len",
    "ln",
    "log",
    "lookup",
    "max",
    "min",
    "norm",
    "ord",
    "parent_module",
    "pow",
    "rands",
    "round",
    "search",
    "sign",
    "sin",
    "sqrt",
    "str",
    "tan",
    "version",
    "version_num",
];

pub const BUILTIN_CONSTANTS: &[&str] = &["PI"];
