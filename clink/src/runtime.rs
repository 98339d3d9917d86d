//! Registration of natives and the process-wide function table.
//!
//! `wrap_*` turns a native fn pointer into a [`Closure`], validates its code
//! address, and binds it to an interned name in one of three namespaces.
//! [`Runtime::fixup`] is the single entry point a snapshot loader calls after
//! reloading the image.
use std::{
    collections::HashMap,
    hash::{DefaultHasher, Hash, Hasher},
    sync::Arc,
};

use parking_lot::RwLock;

use crate::{
    CallError, Closure, ClosureKind, CodePointerCell, CodeSpace, FunctionDescription, Interner,
    LambdaListBinder, NativeFunction, NativeMethod, RelocationError, RelocationMap,
    ReturnValues, Symbol, SymbolTable, ThreadCreateInfo, ThreadLocalState, Value,
    closure::ClosureParts, split_qualified,
};

/// Bytes of a native entry point the bridge knows about.
const NATIVE_CODE_SPAN: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Function,
    Setf,
    Macro,
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub default_package: String,
    pub threads: ThreadCreateInfo,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            default_package: "CORE".to_string(),
            threads: ThreadCreateInfo::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeCreateInfo {
    pub default_package: Option<String>,
    pub threads: Option<ThreadCreateInfo>,
}

impl RuntimeCreateInfo {
    pub fn settings(&self) -> RuntimeSettings {
        let mut settings = RuntimeSettings::default();
        self.default_package
            .as_ref()
            .inspect(|p| settings.default_package = p.to_string());
        self.threads.inspect(|&t| settings.threads = t);
        settings
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixupReport {
    pub visited: usize,
    pub moved: usize,
}

struct RuntimeShared {
    settings: RuntimeSettings,
    symbols: Arc<dyn SymbolTable>,
    code: CodeSpace,
    bindings: RwLock<HashMap<(Namespace, Symbol), Arc<Closure>, ahash::RandomState>>,
    // registration order, each live closure once
    closures: RwLock<Vec<Arc<Closure>>>,
}

#[derive(Clone)]
pub struct Runtime {
    shared: Arc<RuntimeShared>,
}

impl Runtime {
    pub fn new(info: RuntimeCreateInfo) -> Self {
        Self::with_symbols(info, Arc::new(Interner::new()))
    }

    pub fn with_symbols(info: RuntimeCreateInfo, symbols: Arc<dyn SymbolTable>) -> Self {
        Self {
            shared: Arc::new(RuntimeShared {
                settings: info.settings(),
                symbols,
                code: CodeSpace::new(),
                bindings: RwLock::new(HashMap::default()),
                closures: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.shared.settings
    }

    pub fn code_space(&self) -> &CodeSpace {
        &self.shared.code
    }

    pub fn symbols(&self) -> &dyn SymbolTable {
        &*self.shared.symbols
    }

    /// Interns `name`, which may carry a `pkg:` prefix.
    pub fn intern(&self, name: &str) -> Symbol {
        let (package, name) = split_qualified(name, &self.shared.settings.default_package);
        self.shared.symbols.intern(package, name)
    }

    pub fn wrap_function<F, Args>(
        &self,
        name: &str,
        f: F,
        description: FunctionDescription,
    ) -> Arc<Closure>
    where
        F: NativeFunction<Args>,
    {
        let parts = self.parts(name, description, ClosureKind::Function, F::ARITY, F::invoke);
        self.register(Namespace::Function, parts, f.address())
    }

    /// Like [`Runtime::wrap_function`], binding arguments through `binder` first.
    ///
    /// # Panics
    /// if the binder's frame does not match the native arity
    pub fn wrap_function_lambda_list<F, Args>(
        &self,
        name: &str,
        f: F,
        binder: Arc<dyn LambdaListBinder>,
        description: FunctionDescription,
    ) -> Arc<Closure>
    where
        F: NativeFunction<Args>,
    {
        let mut parts = self.parts(name, description, ClosureKind::Function, F::ARITY, F::invoke);
        parts.binder = Some(checked_binder(name, binder, F::ARITY));
        self.register(Namespace::Function, parts, f.address())
    }

    pub fn wrap_function_setf<F, Args>(
        &self,
        name: &str,
        f: F,
        description: FunctionDescription,
    ) -> Arc<Closure>
    where
        F: NativeFunction<Args>,
    {
        let parts = self.parts(name, description, ClosureKind::Function, F::ARITY, F::invoke);
        self.register(Namespace::Setf, parts, f.address())
    }

    /// Registers a method; slot 0 of every call is the receiver.
    pub fn wrap_method<M, Receiver, Args>(
        &self,
        name: &str,
        method: M,
        description: FunctionDescription,
    ) -> Arc<Closure>
    where
        M: NativeMethod<Receiver, Args>,
    {
        let parts = self.parts(name, description, method_kind(M::MUTABLE), M::ARITY, M::invoke);
        self.register(Namespace::Function, parts, method.address())
    }

    /// # Panics
    /// if the binder's frame does not match the method arity
    pub fn wrap_method_lambda_list<M, Receiver, Args>(
        &self,
        name: &str,
        method: M,
        binder: Arc<dyn LambdaListBinder>,
        description: FunctionDescription,
    ) -> Arc<Closure>
    where
        M: NativeMethod<Receiver, Args>,
    {
        let mut parts =
            self.parts(name, description, method_kind(M::MUTABLE), M::ARITY, M::invoke);
        parts.binder = Some(checked_binder(name, binder, M::ARITY));
        self.register(Namespace::Function, parts, method.address())
    }

    pub fn defmacro(
        &self,
        name: &str,
        expander: fn(Value, Value) -> ReturnValues,
        description: FunctionDescription,
    ) -> Arc<Closure> {
        type Expander = fn(Value, Value) -> ReturnValues;
        let parts = self.parts(
            name,
            description,
            ClosureKind::Macro,
            <Expander as NativeFunction<(Value, Value)>>::ARITY,
            <Expander as NativeFunction<(Value, Value)>>::invoke,
        );
        self.register(
            Namespace::Macro,
            parts,
            <Expander as NativeFunction<(Value, Value)>>::address(expander),
        )
    }

    pub fn wrap_translator(&self, name: &str, translate: fn(Value) -> Value) -> Arc<Closure> {
        type Translator = fn(Value) -> Value;
        let parts = self.parts(
            name,
            FunctionDescription::new("(object)"),
            ClosureKind::Translator,
            <Translator as NativeFunction<(Value,)>>::ARITY,
            <Translator as NativeFunction<(Value,)>>::invoke,
        );
        self.register(
            Namespace::Function,
            parts,
            <Translator as NativeFunction<(Value,)>>::address(translate),
        )
    }

    pub fn function(&self, symbol: Symbol, namespace: Namespace) -> Option<Arc<Closure>> {
        self.shared.bindings.read().get(&(namespace, symbol)).cloned()
    }

    pub fn lookup(&self, name: &str, namespace: Namespace) -> Option<Arc<Closure>> {
        let (package, name) = split_qualified(name, &self.shared.settings.default_package);
        let symbol = self.shared.symbols.lookup(package, name)?;
        self.function(symbol, namespace)
    }

    /// Calls the function bound to `name` on the calling thread.
    pub fn call(
        &self,
        tls: &mut ThreadLocalState,
        name: &str,
        args: &[Value],
    ) -> Result<ReturnValues, CallError> {
        let closure = self
            .lookup(name, Namespace::Function)
            .ok_or_else(|| CallError::UndefinedFunction {
                name: name.to_string(),
            })?;
        closure.call(tls, args)
    }

    pub fn closures(&self) -> Vec<Arc<Closure>> {
        self.shared.closures.read().clone()
    }

    /// Rewrites every closure's code address for a reloaded image.
    ///
    /// Must run before any call is dispatched on the reloaded image. Either every
    /// cell moves or, on error, none does.
    pub fn fixup(&self, map: &RelocationMap) -> Result<FixupReport, RelocationError> {
        let closures = self.shared.closures.read();
        let in_flight: usize = closures.iter().map(|c| c.in_flight()).sum();
        if in_flight > 0 {
            log::error!("fixup refused, {in_flight} calls in flight");
            return Err(RelocationError::CallsInFlight(in_flight));
        }
        for closure in closures.iter() {
            if let Err(err) = closure.code().relocated_address(closure.name(), map) {
                log::error!("fixup aborted: {err}");
                return Err(err);
            }
        }
        let mut report = FixupReport::default();
        for closure in closures.iter() {
            report.visited += 1;
            if closure.code().fixup(closure.name(), map)? {
                report.moved += 1;
            }
        }
        for region in self.shared.code.regions() {
            if let Some((base, len)) = map.get(&region.image) {
                self.shared.code.rebase(&region.image, base, len);
            }
        }
        log::debug!(
            "fixup visited {} closures, moved {}",
            report.visited,
            report.moved
        );
        Ok(report)
    }

    /// Hash over every registration's name and arity, in order. An image built
    /// against a different set of natives hashes differently.
    pub fn registration_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        for closure in self.shared.closures.read().iter() {
            let name = self.shared.symbols.qualified_name(closure.symbol());
            name.map(|n| n.to_string()).hash(&mut hasher);
            closure.kind().hash(&mut hasher);
            closure.arity().to_string().hash(&mut hasher);
        }
        hasher.finish()
    }

    fn parts(
        &self,
        name: &str,
        description: FunctionDescription,
        kind: ClosureKind,
        native_arity: usize,
        invoker: crate::Invoker,
    ) -> ClosureParts {
        ClosureParts {
            name: name.to_string(),
            symbol: self.intern(name),
            description,
            kind,
            native_arity,
            invoker,
            binder: None,
        }
    }

    fn register(&self, namespace: Namespace, parts: ClosureParts, address: usize) -> Arc<Closure> {
        let code = match CodePointerCell::validate(
            &parts.name,
            address,
            NATIVE_CODE_SPAN,
            &self.shared.code,
        ) {
            Ok(cell) => cell,
            Err(err) => {
                log::error!("{err}");
                panic!("invalid native code pointer: {err}");
            }
        };
        let symbol = parts.symbol;
        let closure = Arc::new(Closure::new(parts, code));
        log::debug!(
            "registered {:?} {} ({:?}, arity {}) at 0x{:x}",
            namespace,
            closure.name(),
            closure.strategy(),
            closure.arity(),
            closure.code().address()
        );
        let replaced = self
            .shared
            .bindings
            .write()
            .insert((namespace, symbol), closure.clone());
        if let Some(old) = replaced {
            log::debug!("{} redefined", old.name());
        }
        self.shared.closures.write().push(closure.clone());
        closure
    }
}

fn method_kind(mutable: bool) -> ClosureKind {
    if mutable {
        ClosureKind::MutMethod
    } else {
        ClosureKind::ConstMethod
    }
}

fn checked_binder(
    name: &str,
    binder: Arc<dyn LambdaListBinder>,
    native_arity: usize,
) -> Arc<dyn LambdaListBinder> {
    if binder.frame_size() != native_arity {
        log::error!(
            "{name}: lambda list binds {} parameters, native takes {native_arity}",
            binder.frame_size()
        );
        panic!("{name}: lambda list does not match native arity");
    }
    binder
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("package", &self.shared.settings.default_package)
            .field("closures", &self.shared.closures.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;

    use proptest::prelude::*;

    use super::*;
    use crate::{
        Arity, ClassId, CodeRegion, DispatchStrategy, Header, LambdaList, NativeObject, Ref,
        ThreadCreateInfo,
    };

    fn add(a: i64, b: i64) -> i64 {
        a + b
    }

    fn f0() -> i64 {
        0
    }
    fn f1(a: i64) -> i64 {
        a
    }
    fn f2(a: i64, b: i64) -> i64 {
        a + b * 10
    }
    fn f3(a: i64, b: i64, c: i64) -> i64 {
        a + b * 10 + c * 100
    }
    fn f4(a: i64, b: i64, c: i64, d: i64) -> i64 {
        a + b * 10 + c * 100 + d * 1000
    }
    fn f5(a: i64, b: i64, c: i64, d: i64, e: i64) -> i64 {
        a + b * 10 + c * 100 + d * 1000 + e * 10000
    }
    fn f7(a: i64, b: i64, c: i64, d: i64, e: i64, f: i64, g: i64) -> i64 {
        a + b + c + d + e + f + g
    }

    fn scale(value: i64, factor: i64) -> i64 {
        value * factor
    }

    static FACTOR: OnceLock<Symbol> = OnceLock::new();

    fn dynamic_factor(_value: i64, _factor: i64) -> Value {
        FACTOR
            .get()
            .and_then(|&factor| crate::symbol_value(factor))
            .unwrap_or(Value::UNBOUND)
    }

    fn set_car(value: Value, _cell: Value) -> Value {
        value
    }

    fn expand(form: Value, _env: Value) -> ReturnValues {
        ReturnValues::from_slice(&[form, Value::T]).unwrap()
    }

    fn identity(v: Value) -> Value {
        v
    }

    #[repr(C)]
    struct Account {
        header: Header,
        balance: i64,
    }

    impl NativeObject for Account {
        const CLASS: ClassId = ClassId(501);
        const NAME: &'static str = "account";
    }

    impl Account {
        fn balance(&self) -> i64 {
            self.balance
        }

        fn deposit(&mut self, amount: i64) -> i64 {
            self.balance += amount;
            self.balance
        }

        fn merge(&mut self, other: Ref<Account>) -> i64 {
            self.balance += other.balance;
            self.balance
        }
    }

    fn addresses() -> Vec<usize> {
        vec![
            add as fn(i64, i64) -> i64 as usize,
            f0 as fn() -> i64 as usize,
            f1 as fn(i64) -> i64 as usize,
            f2 as fn(i64, i64) -> i64 as usize,
            f3 as fn(i64, i64, i64) -> i64 as usize,
            f4 as fn(i64, i64, i64, i64) -> i64 as usize,
            f5 as fn(i64, i64, i64, i64, i64) -> i64 as usize,
            f7 as fn(i64, i64, i64, i64, i64, i64, i64) -> i64 as usize,
            scale as fn(i64, i64) -> i64 as usize,
            dynamic_factor as fn(i64, i64) -> Value as usize,
            set_car as fn(Value, Value) -> Value as usize,
            expand as fn(Value, Value) -> ReturnValues as usize,
            identity as fn(Value) -> Value as usize,
            Account::balance as fn(&Account) -> i64 as usize,
            Account::deposit as fn(&mut Account, i64) -> i64 as usize,
            Account::merge as fn(&mut Account, Ref<Account>) -> i64 as usize,
            reentrant_fixup as fn() -> bool as usize,
        ]
    }

    fn runtime() -> Runtime {
        let rt = Runtime::new(RuntimeCreateInfo::default());
        rt.code_space()
            .register(CodeRegion::covering("test", &addresses()));
        rt
    }

    fn tls() -> ThreadLocalState {
        ThreadLocalState::new(
            1,
            &ThreadCreateInfo {
                stack_words: Some(256),
                ..Default::default()
            },
        )
    }

    fn ints(values: &[i64]) -> Vec<Value> {
        values.iter().copied().map(Value::fixnum).collect()
    }

    #[test]
    fn add_scenario() {
        let rt = runtime();
        let mut tls = tls();
        rt.wrap_function("add", add as fn(i64, i64) -> i64, FunctionDescription::new("(a b)"));

        let r = rt.call(&mut tls, "add", &ints(&[3, 4])).unwrap();
        assert_eq!(r.count(), 1);
        assert_eq!(r.primary(), Value::fixnum(7));

        let err = rt.call(&mut tls, "add", &ints(&[3, 4, 5])).unwrap_err();
        assert_eq!(err, CallError::arity("add", Arity::Exactly(2), 3));
        assert!(err.to_string().contains("expected 2, got 3"));

        let err = rt
            .call(&mut tls, "add", &[Value::fixnum(3), Value::from_char('x')])
            .unwrap_err();
        assert!(matches!(err, CallError::WrongType { position: 1, .. }));
        assert!(err.to_string().contains("argument 1"));

        assert_eq!(tls.vm.stack_pointer(), 0);
        assert_eq!(tls.bindings.depth(), 0);
    }

    #[test]
    fn undefined_functions_are_reported() {
        let rt = runtime();
        let err = rt.call(&mut tls(), "missing", &[]).unwrap_err();
        assert_eq!(
            err,
            CallError::UndefinedFunction {
                name: "missing".into()
            }
        );
    }

    #[test]
    fn arity_above_five_uses_general_entry() {
        let rt = runtime();
        let mut tls = tls();
        let closure = rt.wrap_function(
            "sum7",
            f7 as fn(i64, i64, i64, i64, i64, i64, i64) -> i64,
            FunctionDescription::default(),
        );
        assert_eq!(closure.arity(), Arity::Exactly(7));
        let r = closure.call(&mut tls, &ints(&[1, 2, 3, 4, 5, 6, 7])).unwrap();
        assert_eq!(r.primary(), Value::fixnum(28));
        let err = closure.call(&mut tls, &ints(&[1, 2, 3])).unwrap_err();
        assert_eq!(err, CallError::arity("sum7", Arity::Exactly(7), 3));
        let err = closure.call(&mut tls, &ints(&[1; 8])).unwrap_err();
        assert_eq!(err, CallError::arity("sum7", Arity::Exactly(7), 8));
    }

    #[test]
    fn lambda_list_functions_take_optional_and_keys() {
        let rt = runtime();
        let mut tls = tls();
        let value = rt.intern("value");
        let factor = rt.intern("factor");
        let kw_factor = rt.intern(":factor");
        let list = LambdaList::new()
            .required(value)
            .key(kw_factor, factor, Value::fixnum(2))
            .special(factor);
        let closure = rt.wrap_function_lambda_list(
            "scale",
            scale as fn(i64, i64) -> i64,
            Arc::new(list),
            FunctionDescription::new("(value &key (factor 2))"),
        );
        assert_eq!(closure.strategy(), DispatchStrategy::LambdaList);
        assert_eq!(closure.arity(), Arity::Range { min: 1, max: None });

        let r = closure.call(&mut tls, &ints(&[21])).unwrap();
        assert_eq!(r.primary(), Value::fixnum(42));
        let r = closure
            .call(
                &mut tls,
                &[Value::fixnum(5), Value::from_symbol(kw_factor), Value::fixnum(3)],
            )
            .unwrap();
        assert_eq!(r.primary(), Value::fixnum(15));
        assert_eq!(tls.bindings.depth(), 0);
        assert_eq!(tls.bindings.value(factor), None);

        let err = closure.call(&mut tls, &[]).unwrap_err();
        assert!(matches!(err, CallError::ArityMismatch { actual: 0, .. }));
    }

    #[test]
    fn natives_see_their_special_bindings() {
        let rt = runtime();
        let mut tls = tls();
        let factor = rt.intern("factor");
        assert_eq!(*FACTOR.get_or_init(|| factor), factor);
        let kw_factor = rt.intern(":factor");
        let list = LambdaList::new()
            .required(rt.intern("value"))
            .key(kw_factor, factor, Value::fixnum(2))
            .special(factor);
        let closure = rt.wrap_function_lambda_list(
            "dynamic-factor",
            dynamic_factor as fn(i64, i64) -> Value,
            Arc::new(list),
            FunctionDescription::new("(value &key (factor 2))"),
        );

        let r = closure.call(&mut tls, &ints(&[1])).unwrap();
        assert_eq!(r.primary(), Value::fixnum(2));
        let r = closure
            .call(
                &mut tls,
                &[Value::fixnum(1), Value::from_symbol(kw_factor), Value::fixnum(9)],
            )
            .unwrap();
        assert_eq!(r.primary(), Value::fixnum(9));

        assert_eq!(crate::symbol_value(factor), None);
        assert_eq!(tls.bindings.value(factor), None);
        assert_eq!(tls.bindings.depth(), 0);
    }

    #[test]
    fn direct_natives_see_caller_bindings() {
        let rt = runtime();
        let mut tls = tls();
        let factor = rt.intern("factor");
        assert_eq!(*FACTOR.get_or_init(|| factor), factor);
        let closure = rt.wrap_function(
            "dynamic-factor",
            dynamic_factor as fn(i64, i64) -> Value,
            FunctionDescription::new("(value factor)"),
        );
        let args = ints(&[1, 1]);
        assert_eq!(closure.call(&mut tls, &args).unwrap().primary(), Value::UNBOUND);
        {
            let mut scope = crate::DynamicScope::enter(&mut tls.bindings);
            scope.bind(factor, Value::fixnum(4));
            std::mem::forget(scope);
        }
        assert_eq!(closure.call(&mut tls, &args).unwrap().primary(), Value::fixnum(4));
        tls.bindings.unwind_to(0).unwrap();
    }

    #[test]
    #[should_panic(expected = "lambda list does not match native arity")]
    fn mismatched_lambda_list_is_fatal() {
        let rt = runtime();
        let x = rt.intern("x");
        rt.wrap_function_lambda_list(
            "add",
            add as fn(i64, i64) -> i64,
            Arc::new(LambdaList::new().required(x)),
            FunctionDescription::default(),
        );
    }

    #[test]
    #[should_panic(expected = "invalid native code pointer")]
    fn unregistered_code_is_fatal() {
        let rt = Runtime::new(RuntimeCreateInfo::default());
        rt.wrap_function("add", add as fn(i64, i64) -> i64, FunctionDescription::default());
    }

    #[test]
    fn methods_take_receiver_in_slot_zero() {
        let rt = runtime();
        let mut tls = tls();
        let balance = rt.wrap_method(
            "balance",
            Account::balance as fn(&Account) -> i64,
            FunctionDescription::new("(account)"),
        );
        let deposit = rt.wrap_method(
            "deposit",
            Account::deposit as fn(&mut Account, i64) -> i64,
            FunctionDescription::new("(account amount)"),
        );
        assert_eq!(balance.kind(), ClosureKind::ConstMethod);
        assert_eq!(deposit.kind(), ClosureKind::MutMethod);
        assert_eq!(deposit.arity(), Arity::Exactly(2));

        let account = Box::new(Account {
            header: Header::of::<Account>(),
            balance: 10,
        });
        let this = unsafe { Value::from_object(&*account) };
        let r = deposit.call(&mut tls, &[this, Value::fixnum(5)]).unwrap();
        assert_eq!(r.primary(), Value::fixnum(15));
        let r = balance.call(&mut tls, &[this]).unwrap();
        assert_eq!(r.primary(), Value::fixnum(15));

        let err = balance.call(&mut tls, &[Value::fixnum(1)]).unwrap_err();
        assert!(matches!(
            err,
            CallError::WrongType {
                position: 0,
                expected: "account",
                ..
            }
        ));
    }

    #[test]
    fn mutable_methods_reject_aliased_arguments() {
        let rt = runtime();
        let mut tls = tls();
        let merge = rt.wrap_method(
            "merge",
            Account::merge as fn(&mut Account, Ref<Account>) -> i64,
            FunctionDescription::new("(account other)"),
        );
        let first = Box::new(Account {
            header: Header::of::<Account>(),
            balance: 2,
        });
        let second = Box::new(Account {
            header: Header::of::<Account>(),
            balance: 5,
        });
        let (a, b) = unsafe { (Value::from_object(&*first), Value::from_object(&*second)) };

        let err = merge.call(&mut tls, &[a, a]).unwrap_err();
        assert_eq!(err.to_string(), "merge: argument 1 aliases the mutable receiver");
        assert_eq!(merge.in_flight(), 0);
        let r = merge.call(&mut tls, &[a, b]).unwrap();
        assert_eq!(r.primary(), Value::fixnum(7));
    }

    #[test]
    fn method_with_lambda_list() {
        let rt = runtime();
        let mut tls = tls();
        let account = rt.intern("account");
        let amount = rt.intern("amount");
        let deposit = rt.wrap_method_lambda_list(
            "deposit*",
            Account::deposit as fn(&mut Account, i64) -> i64,
            Arc::new(
                LambdaList::new()
                    .required(account)
                    .optional(amount, Value::fixnum(1)),
            ),
            FunctionDescription::new("(account &optional (amount 1))"),
        );
        let acct = Box::new(Account {
            header: Header::of::<Account>(),
            balance: 0,
        });
        let this = unsafe { Value::from_object(&*acct) };
        deposit.call(&mut tls, &[this]).unwrap();
        let r = deposit.call(&mut tls, &[this, Value::fixnum(4)]).unwrap();
        assert_eq!(r.primary(), Value::fixnum(5));
    }

    #[test]
    fn namespaces_are_separate() {
        let rt = runtime();
        let mut tls = tls();
        rt.wrap_function("car", identity as fn(Value) -> Value, FunctionDescription::default());
        rt.wrap_function_setf(
            "car",
            set_car as fn(Value, Value) -> Value,
            FunctionDescription::new("(value cell)"),
        );
        rt.defmacro("car", expand, FunctionDescription::new("(form env)"));

        let setf = rt.lookup("car", Namespace::Setf).unwrap();
        assert_eq!(setf.arity(), Arity::Exactly(2));
        let mac = rt.lookup("car", Namespace::Macro).unwrap();
        assert_eq!(mac.kind(), ClosureKind::Macro);
        let r = mac.call(&mut tls, &[Value::fixnum(1), Value::NIL]).unwrap();
        assert_eq!(r.count(), 2);
        assert_eq!(r.get(1), Value::T);
        let f = rt.lookup("car", Namespace::Function).unwrap();
        assert_eq!(f.arity(), Arity::Exactly(1));
    }

    #[test]
    fn translators_pass_values_through() {
        let rt = runtime();
        let mut tls = tls();
        let t = rt.wrap_translator("to-object", identity);
        assert_eq!(t.kind(), ClosureKind::Translator);
        let r = t.call(&mut tls, &[Value::from_char('a')]).unwrap();
        assert_eq!(r.primary(), Value::from_char('a'));
    }

    #[test]
    fn packages_qualify_names() {
        let rt = runtime();
        rt.wrap_function("ext:add", add as fn(i64, i64) -> i64, FunctionDescription::default());
        assert!(rt.lookup("add", Namespace::Function).is_none());
        assert!(rt.lookup("ext:add", Namespace::Function).is_some());
        assert!(rt.lookup("ext::add", Namespace::Function).is_some());
    }

    #[test]
    fn redefinition_rebinds_name() {
        let rt = runtime();
        let mut tls = tls();
        rt.wrap_function("op", add as fn(i64, i64) -> i64, FunctionDescription::default());
        rt.wrap_function("op", f2 as fn(i64, i64) -> i64, FunctionDescription::default());
        let r = rt.call(&mut tls, "op", &ints(&[1, 2])).unwrap();
        assert_eq!(r.primary(), Value::fixnum(21));
        assert_eq!(rt.closures().len(), 2);
    }

    #[cfg(feature = "call-counters")]
    #[test]
    fn calls_are_counted() {
        let rt = runtime();
        let mut tls = tls();
        let direct =
            rt.wrap_function("add", add as fn(i64, i64) -> i64, FunctionDescription::default());
        let (a, b) = (rt.intern("a"), rt.intern("b"));
        let bound = rt.wrap_function_lambda_list(
            "add*",
            add as fn(i64, i64) -> i64,
            Arc::new(LambdaList::new().required(a).required(b)),
            FunctionDescription::new("(a b)"),
        );
        for c in [&direct, &bound] {
            for _ in 0..3 {
                c.call(&mut tls, &ints(&[1, 1])).unwrap();
            }
            assert!(c.call(&mut tls, &ints(&[1])).is_err());
            assert!(c.call(&mut tls, &ints(&[1, 2, 3, 4, 5, 6, 7])).is_err());
        }
        assert_eq!(direct.call_count(), 5);
        assert_eq!(bound.call_count(), direct.call_count());
    }

    #[test]
    fn fixup_relocates_every_closure_once() {
        let rt = runtime();
        let a = rt.wrap_function("add", add as fn(i64, i64) -> i64, FunctionDescription::default());
        let b = rt.wrap_function("f1", f1 as fn(i64) -> i64, FunctionDescription::default());
        let region = rt.code_space().regions()[0].clone();
        let mut map = RelocationMap::new();
        map.insert("test", region.base + 0x1000, region.len);

        let report = rt.fixup(&map).unwrap();
        assert_eq!(report, FixupReport { visited: 2, moved: 2 });
        assert_eq!(a.code().address(), (add as fn(i64, i64) -> i64 as usize) + 0x1000);
        let moved = b.code().address();

        let report = rt.fixup(&map).unwrap();
        assert_eq!(report, FixupReport { visited: 2, moved: 0 });
        assert_eq!(b.code().address(), moved);

        map.insert("test", region.base, region.len);
        rt.fixup(&map).unwrap();
        let mut tls = tls();
        let r = a.call(&mut tls, &ints(&[1, 2])).unwrap();
        assert_eq!(r.primary(), Value::fixnum(3));
    }

    #[test]
    fn fixup_failure_names_closure_and_moves_nothing() {
        let rt = runtime();
        let a = rt.wrap_function("add", add as fn(i64, i64) -> i64, FunctionDescription::default());
        let before = a.code().address();
        let err = rt.fixup(&RelocationMap::new()).unwrap_err();
        assert_eq!(err.function(), Some("add"));
        assert_eq!(a.code().address(), before);
    }

    static REENTRANT: OnceLock<Runtime> = OnceLock::new();

    fn reentrant_fixup() -> bool {
        let rt = REENTRANT.get().unwrap();
        let map = RelocationMap::new();
        matches!(rt.fixup(&map), Err(RelocationError::CallsInFlight(1)))
    }

    #[test]
    fn fixup_refuses_while_calls_in_flight() {
        let rt = REENTRANT.get_or_init(runtime);
        let c = rt.wrap_function(
            "reenter",
            reentrant_fixup as fn() -> bool,
            FunctionDescription::default(),
        );
        let r = c.call(&mut tls(), &[]).unwrap();
        assert_eq!(r.primary(), Value::T);
        assert_eq!(c.in_flight(), 0);
    }

    #[test]
    fn registration_hash_tracks_registrations() {
        let a = runtime();
        let b = runtime();
        assert_eq!(a.registration_hash(), b.registration_hash());
        a.wrap_function("add", add as fn(i64, i64) -> i64, FunctionDescription::default());
        assert_ne!(a.registration_hash(), b.registration_hash());
        b.wrap_function("add", add as fn(i64, i64) -> i64, FunctionDescription::default());
        assert_eq!(a.registration_hash(), b.registration_hash());
    }

    fn register_arity(rt: &Runtime, arity: usize, strategy: DispatchStrategy) -> Arc<Closure> {
        let name = format!("f{arity}-{strategy:?}");
        let desc = FunctionDescription::default();
        if strategy == DispatchStrategy::Direct {
            match arity {
                0 => rt.wrap_function(&name, f0 as fn() -> i64, desc),
                1 => rt.wrap_function(&name, f1 as fn(i64) -> i64, desc),
                2 => rt.wrap_function(&name, f2 as fn(i64, i64) -> i64, desc),
                3 => rt.wrap_function(&name, f3 as fn(i64, i64, i64) -> i64, desc),
                4 => rt.wrap_function(&name, f4 as fn(i64, i64, i64, i64) -> i64, desc),
                _ => rt.wrap_function(&name, f5 as fn(i64, i64, i64, i64, i64) -> i64, desc),
            }
        } else {
            let list = (0..arity).fold(LambdaList::new(), |l, i| {
                l.required(rt.intern(&format!("p{i}")))
            });
            let list: Arc<dyn LambdaListBinder> = Arc::new(list);
            match arity {
                0 => rt.wrap_function_lambda_list(&name, f0 as fn() -> i64, list, desc),
                1 => rt.wrap_function_lambda_list(&name, f1 as fn(i64) -> i64, list, desc),
                2 => rt.wrap_function_lambda_list(&name, f2 as fn(i64, i64) -> i64, list, desc),
                3 => rt.wrap_function_lambda_list(&name, f3 as fn(i64, i64, i64) -> i64, list, desc),
                4 => rt.wrap_function_lambda_list(
                    &name,
                    f4 as fn(i64, i64, i64, i64) -> i64,
                    list,
                    desc,
                ),
                _ => rt.wrap_function_lambda_list(
                    &name,
                    f5 as fn(i64, i64, i64, i64, i64) -> i64,
                    list,
                    desc,
                ),
            }
        }
    }

    fn direct(values: &[i64]) -> i64 {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| v * 10i64.pow(i as u32))
            .sum()
    }

    proptest! {
        #[test]
        fn exact_arity_matches_direct_call(
            arity in 0usize..=5,
            lambda_list in any::<bool>(),
            values in prop::collection::vec(-1000i64..1000, 5),
        ) {
            let strategy = if lambda_list { DispatchStrategy::LambdaList } else { DispatchStrategy::Direct };
            let rt = runtime();
            let mut tls = tls();
            let closure = register_arity(&rt, arity, strategy);
            prop_assert_eq!(closure.strategy(), strategy);
            let args = &values[..arity];
            let r = closure.call(&mut tls, &ints(args)).unwrap();
            prop_assert_eq!(r.primary(), Value::fixnum(direct(args)));
        }

        #[test]
        fn wrong_arity_reports_expected_and_actual(
            arity in 0usize..=5,
            supplied in 0usize..=8,
            lambda_list in any::<bool>(),
        ) {
            prop_assume!(arity != supplied);
            let strategy = if lambda_list { DispatchStrategy::LambdaList } else { DispatchStrategy::Direct };
            let rt = runtime();
            let mut tls = tls();
            let closure = register_arity(&rt, arity, strategy);
            let err = closure.call(&mut tls, &ints(&vec![1; supplied])).unwrap_err();
            let expected = format!("expected {arity}, got {supplied}");
            prop_assert!(err.to_string().contains(&expected), "{}", err);
            prop_assert_eq!(tls.vm.stack_pointer(), 0);
        }
    }
}
