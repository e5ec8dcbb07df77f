#![no_main]

use exprpipe::{Expr, Functions, Results, Scalar, Value, Vars};
use libfuzzer_sys::fuzz_target;

// Parsing arbitrary input must never panic, and anything that parses
// must evaluate without panicking when its variables are bound.
fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    let functions = Functions::builtin();
    let Ok(expr) = Expr::parse(input, &functions) else {
        return;
    };

    let mut vars = Vars::new();
    for name in expr.var_names() {
        vars.insert(
            name.clone(),
            Results::new(vec![Value::Scalar(Scalar::new(Some(1.0)))]),
        );
    }
    let _ = expr.execute(&vars);
});
