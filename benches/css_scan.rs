use criterion::{black_box, criterion_group, criterion_main, Criterion};

use rfgrid::css::discover_urls;

fn stylesheet(rules: usize) -> String {
    let mut css = String::from("@import url(reset.css);\n@import 'theme.css' screen;\n");
    css.push_str("@font-face { font-family: Body; src: url(/fonts/body.woff2) format('woff2'), url(/fonts/body.woff) format('woff'); }\n");
    for i in 0..rules {
        css.push_str(&format!(
            ".card-{i} {{ color: #333; margin: 0 auto; background: #fff url(img/card-{i}.png) no-repeat; }}\n"
        ));
        if i % 10 == 0 {
            css.push_str(&format!(
                "@media (min-width: {}px) {{ .hero-{i} {{ background-image: url('img/hero-{i}.jpg'), url(data:image/png;base64,AAAA); }} }}\n",
                600 + i
            ));
        }
    }
    css
}

fn bench_discover_urls(c: &mut Criterion) {
    let small = stylesheet(20);
    let large = stylesheet(2000);

    c.bench_function("discover_urls_small", |b| b.iter(|| discover_urls(black_box(&small))));
    c.bench_function("discover_urls_large", |b| b.iter(|| discover_urls(black_box(&large))));
}

criterion_group!(benches, bench_discover_urls);
criterion_main!(benches);
