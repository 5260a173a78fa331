//! VM execution benchmarks

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use melon_runtime::Melon;

fn bench_recursive_calls(c: &mut Criterion) {
    let source = r#"
        func fib(n) {
            if (n < 2) { return n; }
            return fib(n - 1) + fib(n - 2);
        }
        fib(15);
    "#;
    let melon = Melon::new();
    c.bench_function("fib_15", |b| {
        b.iter(|| melon.eval(black_box(source)).unwrap())
    });
}

fn bench_loop_sum(c: &mut Criterion) {
    let source = r#"
        var sum = 0;
        for (var i in 0..2000) {
            sum = sum + i;
        }
        sum;
    "#;
    let melon = Melon::new();
    c.bench_function("range_sum_2000", |b| {
        b.iter(|| melon.eval(black_box(source)).unwrap())
    });
}

fn bench_closure_counter(c: &mut Criterion) {
    let source = r#"
        func make() {
            var c = 0;
            func inc() { c = c + 1; return c; }
            return inc;
        }
        var f = make();
        var i = 0;
        while (i < 500) {
            f();
            i = i + 1;
        }
        f();
    "#;
    let melon = Melon::new();
    c.bench_function("closure_counter_500", |b| {
        b.iter(|| melon.eval(black_box(source)).unwrap())
    });
}

criterion_group!(
    benches,
    bench_recursive_calls,
    bench_loop_sum,
    bench_closure_counter
);
criterion_main!(benches);
