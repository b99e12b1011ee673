use std::io::Cursor;

use coffre_crypto::Cryptor;

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

#[divan::bench(args = [65536, 1048576, 16777216])]
fn bench_encrypt_file(bencher: divan::Bencher, size: usize) {
    let cryptor = Cryptor::new();
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            let mut sink = Cursor::new(Vec::with_capacity(size + 4096));
            cryptor
                .encrypt_file(divan::black_box(&data[..]), &mut sink)
                .unwrap()
        });
}

#[divan::bench(args = [65536, 1048576, 16777216])]
fn bench_decrypt_file(bencher: divan::Bencher, size: usize) {
    let cryptor = Cryptor::new();
    let data = make_data(size);
    let mut sink = Cursor::new(Vec::new());
    cryptor.encrypt_file(&data[..], &mut sink).unwrap();
    let ciphertext = sink.into_inner();

    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            let mut source = Cursor::new(divan::black_box(&ciphertext[..]).to_vec());
            let mut out = Vec::with_capacity(size);
            cryptor.decrypt_file(&mut source, &mut out, true).unwrap()
        });
}

#[divan::bench]
fn bench_encrypt_filename(bencher: divan::Bencher) {
    let cryptor = Cryptor::new();
    bencher.bench(|| {
        cryptor
            .encrypt_filename(divan::black_box("quarterly-report-final-v7.xlsx"))
            .unwrap()
    });
}

fn main() {
    divan::main();
}
