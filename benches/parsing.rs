use criterion::{criterion_group, criterion_main, Criterion};

use mtxbox::codec;
use mtxbox::parser::address::parse_address_list;
use mtxbox::parser::{parse_source, ParseContext, RawMessage};

fn sample_message() -> Vec<u8> {
    let mut msg = String::from(
        "From: \"Alice Liddell\" <alice@example.com>\r\n\
         To: bob@example.org, Carol <carol@example.net>, team: dave@x.org, erin@y.org;\r\n\
         Subject: =?UTF-8?Q?Quarterly_caf=C3=A9_report?=\r\n\
         Date: Thu, 4 Jan 2024 10:00:00 +0000\r\n\
         Message-ID: <report@example.com>\r\n\
         Content-Type: multipart/mixed; boundary=\"sep\"\r\n\
         \r\n\
         --sep\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Transfer-Encoding: quoted-printable\r\n\
         \r\n",
    );
    for _ in 0..50 {
        msg.push_str("Revenue is up, costs are down, na=C3=AFve forecasts were wrong.\r\n");
    }
    msg.push_str(
        "--sep\r\n\
         Content-Type: application/pdf; name=report.pdf\r\n\
         Content-Transfer-Encoding: base64\r\n\
         \r\n",
    );
    let pdf: Vec<u8> = (0..16 * 1024).map(|i| (i % 251) as u8).collect();
    msg.push_str(std::str::from_utf8(&codec::base64::encode(&pdf)).unwrap_or_default());
    msg.push_str("--sep--\r\n");
    msg.into_bytes()
}

fn bench_parse_message(c: &mut Criterion) {
    let raw = RawMessage::from_bytes(&sample_message());
    let ctx = ParseContext::default();
    c.bench_function("parse_message", |b| {
        b.iter(|| parse_source(&raw, &ctx).unwrap())
    });
}

fn bench_address_list(c: &mut Criterion) {
    let list = (0..100)
        .map(|i| format!("\"User {i} (ops)\" <user{i}@example.com>"))
        .collect::<Vec<_>>()
        .join(", ");
    c.bench_function("parse_address_list_100", |b| {
        b.iter(|| parse_address_list(&list, "localhost").unwrap())
    });
}

fn bench_codecs(c: &mut Criterion) {
    let data: Vec<u8> = (0..64 * 1024).map(|i| (i * 7 % 256) as u8).collect();
    let b64 = codec::base64::encode(&data);
    let qp = codec::qp::encode(&data);
    c.bench_function("base64_decode_64k", |b| {
        b.iter(|| codec::base64::decode(&b64).unwrap())
    });
    c.bench_function("qp_decode_64k", |b| b.iter(|| codec::qp::decode(&qp)));
}

criterion_group!(benches, bench_parse_message, bench_address_list, bench_codecs);
criterion_main!(benches);
