//! Evaluation engine backing the embedded backend.
//!
//! A small Clojure-subset interpreter providing the evaluation environment:
//! namespaced vars with doc and source metadata, arithmetic, definitions,
//! and the introspection forms the bridge generates (`doc`, `source`,
//! `apropos`, `dir`, `macroexpand`). The environment lives outside the
//! network listener on purpose: restarting the listener must not reset it.
//!
//! Evaluation is cooperative: an interrupt flag is checked inside loops and
//! on a step budget so a wedged computation can be cancelled from outside
//! without tearing the process down.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Maximum nested call depth before evaluation faults.
const MAX_DEPTH: usize = 200;

/// Evaluation steps between interrupt-flag checks.
const INTERRUPT_CHECK_STEPS: u64 = 1024;

/// Builtin functions and their doc strings, searchable via `apropos`.
const BUILTINS: &[(&str, &str)] = &[
    ("+", "Returns the sum of nums."),
    ("-", "Subtracts the remaining nums from the first."),
    ("*", "Returns the product of nums."),
    ("/", "Divides the first num by the rest. Faults on zero."),
    ("=", "Equality. Returns true when all arguments are equal."),
    ("<", "Returns true when arguments are in ascending order."),
    (">", "Returns true when arguments are in descending order."),
    ("str", "Concatenates the string representations of its arguments."),
    ("println", "Prints its arguments followed by a newline."),
    ("list", "Creates a list containing the arguments."),
    ("first", "Returns the first item of a collection, or nil."),
    ("rest", "Returns the collection without its first item."),
    ("count", "Returns the number of items in a collection."),
    ("map", "Returns the list of applying f to each item of coll."),
    ("sort", "Returns a sorted copy of coll."),
    ("all-ns", "Returns the list of namespace symbols."),
    ("load-file", "Loads and evaluates a file of source forms."),
    ("apropos", "Returns the symbols whose names contain the query."),
    ("macroexpand", "Repeatedly expands a quoted form until stable."),
    ("macroexpand-1", "Expands a quoted form one step."),
];

/// A value in the evaluation environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datum {
    /// The nil value.
    Nil,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// String.
    Str(String),
    /// Symbol.
    Sym(String),
    /// Keyword (`:name`).
    Keyword(String),
    /// List form.
    List(Vec<Datum>),
    /// Vector form.
    Vector(Vec<Datum>),
    /// User-defined function.
    Fn(Arc<Lambda>),
    /// Builtin function, identified by name.
    Builtin(&'static str),
}

/// A user-defined function.
#[derive(Debug, PartialEq, Eq)]
pub struct Lambda {
    /// Parameter names.
    pub params: Vec<String>,
    /// Body forms, evaluated in order.
    pub body: Vec<Datum>,
    /// Namespace the function was defined in; free symbols resolve here.
    pub ns: String,
}

/// A fault raised by evaluation: the backend analogue of an exception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalFault {
    /// Human-readable fault description.
    pub message: String,
}

impl EvalFault {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for EvalFault {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.message)
    }
}

/// A named var with its metadata.
#[derive(Debug, Clone)]
pub struct Var {
    /// Current value.
    pub value: Datum,
    /// Doc string, when one was supplied.
    pub doc: Option<String>,
    /// Printed source of the defining form.
    pub source: Option<String>,
}

/// The evaluation environment: every namespace and its vars.
///
/// Owned by the supervisor's caller and shared with listeners; it survives
/// listener restarts by construction.
#[derive(Debug)]
pub struct Environment {
    namespaces: BTreeMap<String, BTreeMap<String, Var>>,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    /// Creates an environment with an empty `user` namespace.
    #[must_use]
    pub fn new() -> Self {
        let mut namespaces = BTreeMap::new();
        namespaces.insert("user".to_owned(), BTreeMap::new());
        Self { namespaces }
    }

    fn ensure_namespace(&mut self, name: &str) {
        self.namespaces.entry(name.to_owned()).or_default();
    }

    fn lookup(&self, ns: &str, name: &str) -> Option<&Var> {
        // Namespaced symbols resolve against the named namespace.
        if let Some((ns_part, var_part)) = name.split_once('/') {
            return self.namespaces.get(ns_part)?.get(var_part);
        }
        self.namespaces.get(ns)?.get(name)
    }

    fn define(&mut self, ns: &str, name: &str, var: Var) {
        self.ensure_namespace(ns);
        if let Some(vars) = self.namespaces.get_mut(ns) {
            vars.insert(name.to_owned(), var);
        }
    }
}

/// Everything one evaluation produced.
#[derive(Debug)]
pub struct EvalOutput {
    /// Lines printed during evaluation, in order.
    pub printed: Vec<String>,
    /// One printed value per completed top-level form.
    pub values: Vec<String>,
    /// The fault that ended evaluation early, if any.
    pub fault: Option<EvalFault>,
    /// The namespace in effect when evaluation finished.
    pub ns: String,
}

/// Evaluates `source` against `env` with `ns` as the current namespace.
///
/// Forms are evaluated in order; a fault stops evaluation but retains the
/// output and values produced before it. The `interrupt` flag is polled
/// during evaluation and raises a fault when set.
pub fn eval_source(
    env: &mut Environment,
    ns: &str,
    interrupt: &Arc<AtomicBool>,
    source: &str,
) -> EvalOutput {
    let mut interp = Interpreter {
        env,
        ns: ns.to_owned(),
        printed: Vec::new(),
        interrupt: Arc::clone(interrupt),
        steps: 0,
    };

    let mut values = Vec::new();
    let fault = match read_all(source) {
        Ok(forms) => {
            let mut failure = None;
            for form in forms {
                match interp.eval(&form, &mut Vec::new(), 0) {
                    Ok(value) => values.push(format_datum(&value, true)),
                    Err(fault) => {
                        failure = Some(fault);
                        break;
                    }
                }
            }
            failure
        }
        Err(fault) => Some(fault),
    };

    EvalOutput {
        printed: interp.printed,
        values,
        fault,
        ns: interp.ns,
    }
}

type Scope = Vec<(String, Datum)>;

struct Interpreter<'a> {
    env: &'a mut Environment,
    ns: String,
    printed: Vec<String>,
    interrupt: Arc<AtomicBool>,
    steps: u64,
}

impl Interpreter<'_> {
    fn check_interrupt(&mut self) -> Result<(), EvalFault> {
        self.steps += 1;
        if self.steps % INTERRUPT_CHECK_STEPS == 0 && self.interrupt.load(Ordering::SeqCst) {
            return Err(EvalFault::new("evaluation interrupted"));
        }
        Ok(())
    }

    fn eval(&mut self, form: &Datum, scopes: &mut Scope, depth: usize) -> Result<Datum, EvalFault> {
        self.check_interrupt()?;
        if depth > MAX_DEPTH {
            return Err(EvalFault::new("evaluation exceeded maximum call depth"));
        }

        match form {
            Datum::Nil
            | Datum::Bool(_)
            | Datum::Int(_)
            | Datum::Str(_)
            | Datum::Keyword(_)
            | Datum::Fn(_)
            | Datum::Builtin(_) => Ok(form.clone()),
            Datum::Sym(name) => self.eval_symbol(name, scopes),
            Datum::Vector(items) => {
                let evaluated = items
                    .iter()
                    .map(|item| self.eval(item, scopes, depth + 1))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Datum::Vector(evaluated))
            }
            Datum::List(items) => self.eval_list(items, scopes, depth),
        }
    }

    fn eval_symbol(&mut self, name: &str, scopes: &Scope) -> Result<Datum, EvalFault> {
        if name == "*ns*" {
            return Ok(Datum::Sym(self.ns.clone()));
        }
        if let Some((_, value)) = scopes.iter().rev().find(|(bound, _)| bound == name) {
            return Ok(value.clone());
        }
        if let Some(var) = self.env.lookup(&self.ns, name) {
            return Ok(var.value.clone());
        }
        if let Some(builtin) = resolve_builtin(name) {
            return Ok(Datum::Builtin(builtin));
        }
        Err(EvalFault::new(format!(
            "Unable to resolve symbol: {name} in this context"
        )))
    }

    fn eval_list(
        &mut self,
        items: &[Datum],
        scopes: &mut Scope,
        depth: usize,
    ) -> Result<Datum, EvalFault> {
        let Some((head, args)) = items.split_first() else {
            return Ok(Datum::List(Vec::new()));
        };

        if let Datum::Sym(name) = head {
            match strip_repl_ns(name) {
                "quote" => return Ok(args.first().cloned().unwrap_or(Datum::Nil)),
                "def" => return self.special_def(args, scopes, depth, items),
                "defn" | "when" => {
                    let expanded = expand_macro_once(&Datum::List(items.to_vec()))
                        .ok_or_else(|| EvalFault::new(format!("malformed {name} form")))?;
                    return self.eval(&expanded, scopes, depth + 1);
                }
                "fn" => return self.special_fn(args),
                "if" => return self.special_if(args, scopes, depth),
                "do" => return self.special_do(args, scopes, depth),
                "let" => return self.special_let(args, scopes, depth),
                "while" => return self.special_while(args, scopes, depth),
                "in-ns" => return self.special_in_ns(args, scopes, depth),
                "doc" => return self.special_doc(args),
                "source" => return self.special_source(args),
                "dir" => return self.special_dir(args),
                _ => {}
            }
        }

        let callee = self.eval(head, scopes, depth + 1)?;
        let mut evaluated = Vec::with_capacity(args.len());
        for arg in args {
            evaluated.push(self.eval(arg, scopes, depth + 1)?);
        }
        self.apply(&callee, &evaluated, depth)
    }

    fn special_def(
        &mut self,
        args: &[Datum],
        scopes: &mut Scope,
        depth: usize,
        whole_form: &[Datum],
    ) -> Result<Datum, EvalFault> {
        let Some(Datum::Sym(name)) = args.first() else {
            return Err(EvalFault::new("def expects a symbol name"));
        };
        let (doc, value_form) = match args.get(1) {
            Some(Datum::Str(doc)) if args.len() > 2 => (Some(doc.clone()), args.get(2)),
            other => (None, other.or(Some(&Datum::Nil))),
        };
        let value = match value_form {
            Some(form) => self.eval(form, scopes, depth + 1)?,
            None => Datum::Nil,
        };
        let source = format_datum(&Datum::List(whole_form.to_vec()), true);
        let ns = self.ns.clone();
        self.env.define(
            &ns,
            name,
            Var {
                value,
                doc,
                source: Some(source),
            },
        );
        Ok(Datum::Sym(format!("#'{ns}/{name}")))
    }

    fn special_fn(&self, args: &[Datum]) -> Result<Datum, EvalFault> {
        let params = match args.first() {
            Some(Datum::Vector(params) | Datum::List(params)) => params
                .iter()
                .map(|param| match param {
                    Datum::Sym(name) => Ok(name.clone()),
                    _ => Err(EvalFault::new("fn parameters must be symbols")),
                })
                .collect::<Result<Vec<_>, _>>()?,
            _ => return Err(EvalFault::new("fn expects a parameter vector")),
        };
        Ok(Datum::Fn(Arc::new(Lambda {
            params,
            body: args.get(1..).unwrap_or_default().to_vec(),
            ns: self.ns.clone(),
        })))
    }

    fn special_if(
        &mut self,
        args: &[Datum],
        scopes: &mut Scope,
        depth: usize,
    ) -> Result<Datum, EvalFault> {
        let condition = args
            .first()
            .ok_or_else(|| EvalFault::new("if expects a condition"))?;
        if truthy(&self.eval(condition, scopes, depth + 1)?) {
            match args.get(1) {
                Some(branch) => self.eval(branch, scopes, depth + 1),
                None => Ok(Datum::Nil),
            }
        } else {
            match args.get(2) {
                Some(branch) => self.eval(branch, scopes, depth + 1),
                None => Ok(Datum::Nil),
            }
        }
    }

    fn special_do(
        &mut self,
        args: &[Datum],
        scopes: &mut Scope,
        depth: usize,
    ) -> Result<Datum, EvalFault> {
        let mut last = Datum::Nil;
        for form in args {
            last = self.eval(form, scopes, depth + 1)?;
        }
        Ok(last)
    }

    fn special_let(
        &mut self,
        args: &[Datum],
        scopes: &mut Scope,
        depth: usize,
    ) -> Result<Datum, EvalFault> {
        let Some(Datum::Vector(bindings)) = args.first() else {
            return Err(EvalFault::new("let expects a binding vector"));
        };
        if bindings.len() % 2 != 0 {
            return Err(EvalFault::new("let binding vector must pair names with values"));
        }
        let introduced = bindings.len() / 2;
        for pair in bindings.chunks(2) {
            let (Some(Datum::Sym(name)), Some(value_form)) = (pair.first(), pair.get(1)) else {
                return Err(EvalFault::new("let binding names must be symbols"));
            };
            let value = self.eval(value_form, scopes, depth + 1)?;
            scopes.push((name.clone(), value));
        }
        let result = self.eval_body(args.get(1..).unwrap_or_default(), scopes, depth);
        scopes.truncate(scopes.len().saturating_sub(introduced));
        result
    }

    fn special_while(
        &mut self,
        args: &[Datum],
        scopes: &mut Scope,
        depth: usize,
    ) -> Result<Datum, EvalFault> {
        let condition = args
            .first()
            .ok_or_else(|| EvalFault::new("while expects a condition"))?;
        loop {
            if self.interrupt.load(Ordering::SeqCst) {
                return Err(EvalFault::new("evaluation interrupted"));
            }
            if !truthy(&self.eval(condition, scopes, depth + 1)?) {
                return Ok(Datum::Nil);
            }
            self.eval_body(args.get(1..).unwrap_or_default(), scopes, depth)?;
        }
    }

    fn special_in_ns(
        &mut self,
        args: &[Datum],
        scopes: &mut Scope,
        depth: usize,
    ) -> Result<Datum, EvalFault> {
        let target = args
            .first()
            .map(|form| self.eval(form, scopes, depth + 1))
            .transpose()?;
        let Some(Datum::Sym(name)) = target else {
            return Err(EvalFault::new("in-ns expects a quoted namespace symbol"));
        };
        self.env.ensure_namespace(&name);
        self.ns = name.clone();
        Ok(Datum::Sym(name))
    }

    fn special_doc(&mut self, args: &[Datum]) -> Result<Datum, EvalFault> {
        let Some(Datum::Sym(name)) = args.first() else {
            return Err(EvalFault::new("doc expects a symbol"));
        };
        self.printed.push("-------------------------".to_owned());
        if let Some(var) = self.env.lookup(&self.ns, name) {
            self.printed.push(format!("{}/{name}", self.ns));
            let doc = var.doc.clone().unwrap_or_else(|| "nil".to_owned());
            self.printed.push(format!("  {doc}"));
        } else if let Some(builtin) = resolve_builtin(name) {
            self.printed.push(format!("clojure.core/{builtin}"));
            let doc = builtin_doc(builtin).unwrap_or("nil");
            self.printed.push(format!("  {doc}"));
        } else {
            self.printed.push(format!("  no doc for {name}"));
        }
        Ok(Datum::Nil)
    }

    fn special_source(&mut self, args: &[Datum]) -> Result<Datum, EvalFault> {
        let Some(Datum::Sym(name)) = args.first() else {
            return Err(EvalFault::new("source expects a symbol"));
        };
        let line = self
            .env
            .lookup(&self.ns, name)
            .and_then(|var| var.source.clone())
            .unwrap_or_else(|| "Source not found".to_owned());
        self.printed.push(line);
        Ok(Datum::Nil)
    }

    fn special_dir(&mut self, args: &[Datum]) -> Result<Datum, EvalFault> {
        let Some(Datum::Sym(name)) = args.first() else {
            return Err(EvalFault::new("dir expects a namespace symbol"));
        };
        let Some(vars) = self.env.namespaces.get(name) else {
            return Err(EvalFault::new(format!("No namespace: {name}")));
        };
        // BTreeMap keys are already sorted.
        for var_name in vars.keys() {
            self.printed.push(var_name.clone());
        }
        Ok(Datum::Nil)
    }

    fn eval_body(
        &mut self,
        body: &[Datum],
        scopes: &mut Scope,
        depth: usize,
    ) -> Result<Datum, EvalFault> {
        let mut last = Datum::Nil;
        for form in body {
            last = self.eval(form, scopes, depth + 1)?;
        }
        Ok(last)
    }

    fn apply(&mut self, callee: &Datum, args: &[Datum], depth: usize) -> Result<Datum, EvalFault> {
        match callee {
            Datum::Fn(lambda) => {
                if args.len() != lambda.params.len() {
                    return Err(EvalFault::new(format!(
                        "wrong number of args ({}) passed to fn of {} params",
                        args.len(),
                        lambda.params.len()
                    )));
                }
                let mut scope: Scope = lambda
                    .params
                    .iter()
                    .cloned()
                    .zip(args.iter().cloned())
                    .collect();
                // Free symbols in the body resolve in the defining namespace.
                let caller_ns = std::mem::replace(&mut self.ns, lambda.ns.clone());
                let result = self.eval_body(&lambda.body, &mut scope, depth + 1);
                self.ns = caller_ns;
                result
            }
            Datum::Builtin(name) => self.apply_builtin(name, args, depth),
            other => Err(EvalFault::new(format!(
                "{} cannot be called as a function",
                format_datum(other, true)
            ))),
        }
    }

    fn apply_builtin(
        &mut self,
        name: &str,
        args: &[Datum],
        depth: usize,
    ) -> Result<Datum, EvalFault> {
        match name {
            "+" => arithmetic(args, 0, |acc, n| acc.checked_add(n)),
            "*" => arithmetic(args, 1, |acc, n| acc.checked_mul(n)),
            "-" => fold_from_first(args, |acc, n| acc.checked_sub(n)),
            "/" => {
                if args.iter().skip(1).any(|arg| *arg == Datum::Int(0)) {
                    return Err(EvalFault::new("Divide by zero"));
                }
                fold_from_first(args, |acc, n| acc.checked_div(n))
            }
            "=" => Ok(Datum::Bool(args.windows(2).all(|pair| pair[0] == pair[1]))),
            "<" => compare(args, |a, b| a < b),
            ">" => compare(args, |a, b| a > b),
            "str" => Ok(Datum::Str(
                args.iter()
                    .map(|arg| format_datum(arg, false))
                    .collect::<String>(),
            )),
            "println" => {
                let line = args
                    .iter()
                    .map(|arg| format_datum(arg, false))
                    .collect::<Vec<_>>()
                    .join(" ");
                self.printed.push(line);
                Ok(Datum::Nil)
            }
            "list" => Ok(Datum::List(args.to_vec())),
            "first" => Ok(collection_items(args.first())?.first().cloned().unwrap_or(Datum::Nil)),
            "rest" => Ok(Datum::List(
                collection_items(args.first())?
                    .get(1..)
                    .unwrap_or_default()
                    .to_vec(),
            )),
            "count" => {
                let len = collection_items(args.first())?.len();
                Ok(Datum::Int(i64::try_from(len).unwrap_or(i64::MAX)))
            }
            "map" => {
                let function = args
                    .first()
                    .ok_or_else(|| EvalFault::new("map expects a function"))?
                    .clone();
                let items = collection_items(args.get(1))?.to_vec();
                let mut mapped = Vec::with_capacity(items.len());
                for item in items {
                    mapped.push(self.apply(&function, &[item], depth + 1)?);
                }
                Ok(Datum::List(mapped))
            }
            "sort" => {
                let mut items = collection_items(args.first())?.to_vec();
                items.sort_by_key(|item| format_datum(item, false));
                Ok(Datum::List(items))
            }
            "all-ns" => Ok(Datum::List(
                self.env
                    .namespaces
                    .keys()
                    .map(|ns| Datum::Sym(ns.clone()))
                    .collect(),
            )),
            "load-file" => self.builtin_load_file(args, depth),
            "apropos" => Ok(self.builtin_apropos(args)),
            "macroexpand-1" => Ok(args
                .first()
                .and_then(expand_macro_once)
                .or_else(|| args.first().cloned())
                .unwrap_or(Datum::Nil)),
            "macroexpand" => {
                let mut form = args.first().cloned().unwrap_or(Datum::Nil);
                while let Some(expanded) = expand_macro_once(&form) {
                    form = expanded;
                }
                Ok(form)
            }
            other => Err(EvalFault::new(format!(
                "Unable to resolve symbol: {other} in this context"
            ))),
        }
    }

    fn builtin_load_file(&mut self, args: &[Datum], depth: usize) -> Result<Datum, EvalFault> {
        let Some(Datum::Str(path)) = args.first() else {
            return Err(EvalFault::new("load-file expects a path string"));
        };
        let source = fs::read_to_string(path)
            .map_err(|error| EvalFault::new(format!("could not load {path}: {error}")))?;
        let forms = read_all(&source)?;
        let mut last = Datum::Nil;
        for form in forms {
            last = self.eval(&form, &mut Vec::new(), depth + 1)?;
        }
        Ok(last)
    }

    fn builtin_apropos(&mut self, args: &[Datum]) -> Datum {
        let query = args
            .first()
            .map(|arg| format_datum(arg, false))
            .unwrap_or_default();
        let mut matches = Vec::new();
        for (ns, vars) in &self.env.namespaces {
            for name in vars.keys() {
                if name.contains(&query) {
                    matches.push(Datum::Sym(format!("{ns}/{name}")));
                }
            }
        }
        for (name, _) in BUILTINS {
            if name.contains(&query) {
                matches.push(Datum::Sym(format!("clojure.core/{name}")));
            }
        }
        Datum::List(matches)
    }
}

/// Expands one macro layer of `form`, returning `None` when `form` is not a
/// macro call.
///
/// Supported macros: `defn` (to `def` + `fn`) and `when` (to `if` + `do`).
pub fn expand_macro_once(form: &Datum) -> Option<Datum> {
    let Datum::List(items) = form else {
        return None;
    };
    let (Some(Datum::Sym(head)), args) = (items.first(), items.get(1..).unwrap_or_default())
    else {
        return None;
    };
    match head.as_str() {
        "defn" => {
            let name = args.first()?;
            // An optional doc string sits between the name and the params.
            let (doc, tail) = match args.get(1) {
                Some(Datum::Str(_)) => (args.get(1), args.get(2..).unwrap_or_default()),
                _ => (None, args.get(1..).unwrap_or_default()),
            };
            let mut function = vec![Datum::Sym("fn".to_owned())];
            function.extend(tail.iter().cloned());
            let mut def = vec![Datum::Sym("def".to_owned()), name.clone()];
            if let Some(doc) = doc {
                def.push(doc.clone());
            }
            def.push(Datum::List(function));
            Some(Datum::List(def))
        }
        "when" => {
            let condition = args.first()?;
            let mut body = vec![Datum::Sym("do".to_owned())];
            body.extend(args.get(1..).unwrap_or_default().iter().cloned());
            Some(Datum::List(vec![
                Datum::Sym("if".to_owned()),
                condition.clone(),
                Datum::List(body),
            ]))
        }
        _ => None,
    }
}

/// Renders a datum as text.
///
/// `readably` selects the value-channel rendering (strings quoted, as the
/// REPL prints return values); otherwise the display rendering used by
/// `str` and `println`.
#[must_use]
pub fn format_datum(datum: &Datum, readably: bool) -> String {
    match datum {
        Datum::Nil => "nil".to_owned(),
        Datum::Bool(value) => value.to_string(),
        Datum::Int(value) => value.to_string(),
        Datum::Str(value) => {
            if readably {
                format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
            } else {
                value.clone()
            }
        }
        Datum::Sym(name) => name.clone(),
        Datum::Keyword(name) => format!(":{name}"),
        Datum::List(items) => format!("({})", join_datums(items, readably)),
        Datum::Vector(items) => format!("[{}]", join_datums(items, readably)),
        Datum::Fn(_) => "#function[fn]".to_owned(),
        Datum::Builtin(name) => format!("#function[clojure.core/{name}]"),
    }
}

fn join_datums(items: &[Datum], readably: bool) -> String {
    items
        .iter()
        .map(|item| format_datum(item, readably))
        .collect::<Vec<_>>()
        .join(" ")
}

fn truthy(datum: &Datum) -> bool {
    !matches!(datum, Datum::Nil | Datum::Bool(false))
}

fn resolve_builtin(name: &str) -> Option<&'static str> {
    let bare = strip_repl_ns(name);
    BUILTINS
        .iter()
        .find(|(builtin, _)| *builtin == bare)
        .map(|(builtin, _)| *builtin)
}

fn builtin_doc(name: &str) -> Option<&'static str> {
    BUILTINS
        .iter()
        .find(|(builtin, _)| *builtin == name)
        .map(|(_, doc)| *doc)
}

/// Strips the `clojure.core` / `clojure.repl` qualifier the bridge's
/// generated source uses, so the forms also resolve here.
fn strip_repl_ns(name: &str) -> &str {
    name.strip_prefix("clojure.repl/")
        .or_else(|| name.strip_prefix("clojure.core/"))
        .unwrap_or(name)
}

fn numeric(datum: &Datum) -> Result<i64, EvalFault> {
    match datum {
        Datum::Int(value) => Ok(*value),
        other => Err(EvalFault::new(format!(
            "{} is not a number",
            format_datum(other, true)
        ))),
    }
}

fn arithmetic(
    args: &[Datum],
    identity: i64,
    step: impl Fn(i64, i64) -> Option<i64>,
) -> Result<Datum, EvalFault> {
    let mut acc = identity;
    for arg in args {
        acc = step(acc, numeric(arg)?).ok_or_else(|| EvalFault::new("integer overflow"))?;
    }
    Ok(Datum::Int(acc))
}

fn fold_from_first(
    args: &[Datum],
    step: impl Fn(i64, i64) -> Option<i64>,
) -> Result<Datum, EvalFault> {
    let Some((first, rest)) = args.split_first() else {
        return Err(EvalFault::new("expected at least one argument"));
    };
    let mut acc = numeric(first)?;
    for arg in rest {
        acc = step(acc, numeric(arg)?).ok_or_else(|| EvalFault::new("integer overflow"))?;
    }
    Ok(Datum::Int(acc))
}

fn compare(args: &[Datum], ordered: impl Fn(i64, i64) -> bool) -> Result<Datum, EvalFault> {
    for pair in args.windows(2) {
        let (Some(left), Some(right)) = (pair.first(), pair.get(1)) else {
            continue;
        };
        if !ordered(numeric(left)?, numeric(right)?) {
            return Ok(Datum::Bool(false));
        }
    }
    Ok(Datum::Bool(true))
}

fn collection_items(datum: Option<&Datum>) -> Result<&[Datum], EvalFault> {
    match datum {
        Some(Datum::List(items) | Datum::Vector(items)) => Ok(items),
        Some(Datum::Nil) | None => Ok(&[]),
        Some(other) => Err(EvalFault::new(format!(
            "{} is not a collection",
            format_datum(other, true)
        ))),
    }
}

/// Reads every top-level form in `source`.
///
/// # Errors
///
/// Returns an [`EvalFault`] for unbalanced delimiters or unterminated
/// strings; read faults surface exactly like evaluation faults.
pub fn read_all(source: &str) -> Result<Vec<Datum>, EvalFault> {
    let mut reader = Reader {
        chars: source.chars().collect(),
        position: 0,
    };
    let mut forms = Vec::new();
    loop {
        reader.skip_whitespace();
        if reader.at_end() {
            return Ok(forms);
        }
        forms.push(reader.read_form()?);
    }
}

struct Reader {
    chars: Vec<char>,
    position: usize,
}

impl Reader {
    fn at_end(&self) -> bool {
        self.position >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.position).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.position += 1;
        Some(ch)
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.peek() {
            if ch == ';' {
                while self.peek().is_some_and(|c| c != '\n') {
                    self.position += 1;
                }
            } else if ch.is_whitespace() || ch == ',' {
                self.position += 1;
            } else {
                break;
            }
        }
    }

    fn read_form(&mut self) -> Result<Datum, EvalFault> {
        self.skip_whitespace();
        match self.peek() {
            None => Err(EvalFault::new("unexpected end of input")),
            Some('(') => self.read_sequence(')').map(Datum::List),
            Some('[') => self.read_sequence(']').map(Datum::Vector),
            Some(')') | Some(']') => Err(EvalFault::new("unmatched closing delimiter")),
            Some('\'') => {
                self.position += 1;
                let quoted = self.read_form()?;
                Ok(Datum::List(vec![Datum::Sym("quote".to_owned()), quoted]))
            }
            Some('"') => self.read_string(),
            Some(_) => self.read_atom(),
        }
    }

    fn read_sequence(&mut self, close: char) -> Result<Vec<Datum>, EvalFault> {
        self.position += 1; // opening delimiter
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                None => return Err(EvalFault::new("unbalanced delimiters")),
                Some(ch) if ch == close => {
                    self.position += 1;
                    return Ok(items);
                }
                Some(_) => items.push(self.read_form()?),
            }
        }
    }

    fn read_string(&mut self) -> Result<Datum, EvalFault> {
        self.position += 1; // opening quote
        let mut text = String::new();
        loop {
            match self.advance() {
                None => return Err(EvalFault::new("unterminated string literal")),
                Some('"') => return Ok(Datum::Str(text)),
                Some('\\') => match self.advance() {
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some('"') => text.push('"'),
                    Some('\\') => text.push('\\'),
                    Some(other) => text.push(other),
                    None => return Err(EvalFault::new("unterminated string literal")),
                },
                Some(ch) => text.push(ch),
            }
        }
    }

    fn read_atom(&mut self) -> Result<Datum, EvalFault> {
        let mut token = String::new();
        while let Some(ch) = self.peek() {
            if ch.is_whitespace() || matches!(ch, '(' | ')' | '[' | ']' | '"' | ';' | ',') {
                break;
            }
            token.push(ch);
            self.position += 1;
        }
        Ok(classify_atom(&token))
    }
}

fn classify_atom(token: &str) -> Datum {
    match token {
        "nil" => Datum::Nil,
        "true" => Datum::Bool(true),
        "false" => Datum::Bool(false),
        _ => {
            if let Ok(number) = token.parse::<i64>() {
                Datum::Int(number)
            } else if let Some(name) = token.strip_prefix(':') {
                Datum::Keyword(name.to_owned())
            } else {
                Datum::Sym(token.to_owned())
            }
        }
    }
}
