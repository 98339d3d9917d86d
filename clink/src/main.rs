use clap::Parser as ClapParser;
use std::{
    process,
    sync::{Arc, mpsc},
    thread,
};

use clink::{
    CallError, CodeRegion, FunctionDescription, Interrupt, LambdaList, RelocationMap, Runtime,
    RuntimeCreateInfo, StackTable, ThreadCreateInfo, ThreadLocalState, ThreadManager, Value,
};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[arg(long, default_value_t = 2, help = "Number of worker threads")]
    threads: usize,

    #[arg(long, default_value_t = 1000, help = "Calls per worker")]
    calls: i64,

    #[arg(long, help = "Value stack size of each worker, in words")]
    stack_words: Option<usize>,

    /// Move every native to a shifted image base and back before the last call
    #[arg(long, help = "Simulate an image reload")]
    relocate: bool,
}

fn add(a: i64, b: i64) -> i64 {
    a + b
}

fn floor(number: i64, divisor: i64) -> Result<(i64, i64), CallError> {
    if divisor == 0 {
        return Err(CallError::native("division by zero"));
    }
    Ok((number.div_euclid(divisor), number.rem_euclid(divisor)))
}

fn scale(value: i64, factor: i64) -> i64 {
    value * factor
}

fn natives() -> [usize; 3] {
    [
        add as fn(i64, i64) -> i64 as usize,
        floor as fn(i64, i64) -> Result<(i64, i64), CallError> as usize,
        scale as fn(i64, i64) -> i64 as usize,
    ]
}

fn bootstrap(runtime: &Runtime) {
    runtime
        .code_space()
        .register(CodeRegion::covering("clink", &natives()));
    runtime.wrap_function(
        "add",
        add as fn(i64, i64) -> i64,
        FunctionDescription::new("(a b)").docstring("Sum of two fixnums."),
    );
    runtime.wrap_function(
        "floor",
        floor as fn(i64, i64) -> Result<(i64, i64), CallError>,
        FunctionDescription::new("(number divisor)").docstring("Quotient and remainder."),
    );
    let value = runtime.intern("value");
    let factor = runtime.intern("factor");
    let list = LambdaList::new()
        .required(value)
        .key(runtime.intern(":factor"), factor, Value::fixnum(2));
    runtime.wrap_function_lambda_list(
        "scale",
        scale as fn(i64, i64) -> i64,
        Arc::new(list),
        FunctionDescription::new("(value &key (factor 2))"),
    );
}

fn run_worker(runtime: &Runtime, tls: &mut ThreadLocalState, calls: i64) -> Result<i64, CallError> {
    let factor = Value::from_symbol(runtime.intern(":factor"));
    let mut total = 0;
    for i in 0..calls {
        let sum = runtime.call(tls, "add", &[Value::fixnum(i), Value::fixnum(1)])?;
        let split = runtime.call(tls, "floor", &[sum.primary(), Value::fixnum(7)])?;
        let scaled = runtime.call(tls, "scale", &[split.get(1), factor, Value::fixnum(3)])?;
        total += scaled.primary().as_i64().unwrap_or(0);
    }
    Ok(total)
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    let threads = ThreadCreateInfo {
        stack_words: cli.stack_words,
        ..Default::default()
    };
    let runtime = Runtime::new(RuntimeCreateInfo {
        threads: Some(threads),
        ..Default::default()
    });
    let manager = ThreadManager::new(Arc::new(StackTable::new()), threads);

    let Some(mut main) = manager.attach_main(&threads, || bootstrap(&runtime)) else {
        eprintln!("main thread already attached");
        process::exit(1);
    };
    println!(
        "{} natives registered, registration hash {:016x}",
        runtime.closures().len(),
        runtime.registration_hash()
    );

    let (ready, attached) = mpsc::channel();
    let workers: Vec<_> = (0..cli.threads)
        .map(|_| {
            let runtime = runtime.clone();
            let ready = ready.clone();
            let calls = cli.calls;
            manager.spawn(threads, move |worker| {
                let result = run_worker(&runtime, worker, calls);
                let _ = ready.send(worker.id());
                while worker.pending_interrupts() == 0 {
                    thread::park();
                }
                let handled = worker.handle_interrupts(|tls, interrupt| {
                    log::debug!("thread {} handling {interrupt:?}", tls.id());
                });
                (worker.id(), result, handled)
            })
        })
        .collect();
    drop(ready);

    for id in attached.iter() {
        if let Err(err) = manager.interrupt(id, Interrupt::Stop) {
            eprintln!("could not stop thread {id}: {err}");
        }
    }

    for worker in workers {
        match worker.join() {
            Ok((id, Ok(total), handled)) => {
                println!("thread {id}: total {total}, {handled} interrupts handled")
            }
            Ok((id, Err(err), _)) => eprintln!("thread {id}: {err}"),
            Err(_) => eprintln!("worker panicked"),
        }
    }

    if cli.relocate {
        let Some(region) = runtime.code_space().regions().into_iter().next() else {
            eprintln!("no code region registered");
            process::exit(1);
        };
        let mut map = RelocationMap::new();
        map.insert(&region.image, region.base + 0x10_000, region.len);
        let steps = [
            map.clone(),
            map.insert(&region.image, region.base, region.len).clone(),
        ];
        for step in &steps {
            match runtime.fixup(step) {
                Ok(report) => println!(
                    "relocated: {} closures visited, {} moved",
                    report.visited, report.moved
                ),
                Err(err) => {
                    eprintln!("relocation failed: {err}");
                    process::exit(1);
                }
            }
        }
    }

    match runtime.call(&mut main, "add", &[Value::fixnum(3), Value::fixnum(4)]) {
        Ok(values) => println!("(add 3 4) => {:?}", values.primary()),
        Err(err) => eprintln!("{err}"),
    }
    match runtime.call(&mut main, "add", &[Value::fixnum(3)]) {
        Ok(values) => println!("(add 3) => {:?}", values.primary()),
        Err(err) => println!("(add 3) => {err}"),
    }
}
