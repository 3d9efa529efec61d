
use rand::distributions::Uniform;
use rand::{Rng, SeedableRng};

use crate::builder::FragmentInput;
use crate::workspace::reverse_complement;

const DNA: &[u8] = b"ACGT";
/// Quality given to bases copied correctly from the template
const GOOD_QV: u8 = 30;
/// Quality given to substituted and inserted bases
const ERROR_QV: u8 = 10;

/// Creates a tiled read layout over a random template that we can verify the consensus against.
/// Reads are evenly spaced, sorted by start, and every other read is reverse complemented.
/// # Arguments
/// * `template_len` - the length of the template
/// * `num_reads` - the number of reads to sample
/// * `read_len` - the number of template bases each read covers
/// * `error_rate` - overall error rate, assumes mismatch, insertion, and deletion are equally likely sub-components of this error rate
/// * `seed` - seed for the random generator
pub fn generate_layout(template_len: usize, num_reads: usize, read_len: usize, error_rate: f64, seed: u64) -> (Vec<u8>, Vec<FragmentInput>) {
    assert!(num_reads > 0);
    assert!(read_len > 0 && read_len <= template_len);
    assert!((0.0..=1.0).contains(&error_rate));

    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let base_distribution = Uniform::new(0, DNA.len());
    let basem1_distribution = Uniform::new(1, DNA.len());
    let error_distribution = Uniform::new(0.0, 1.0);
    let error_type_distribution = Uniform::new(0, 3);

    let template: Vec<u8> = (0..template_len)
        .map(|_i| DNA[rng.sample(base_distribution)])
        .collect();

    let span = template_len - read_len;
    let fragments = (0..num_reads)
        .map(|i| {
            let start = if num_reads > 1 { i * span / (num_reads - 1) } else { 0 };
            let end = start + read_len;

            let mut seq = vec![];
            let mut qual = vec![];
            let mut t_index = start;
            while t_index < end {
                let c = template[t_index];
                let is_error = rng.sample(error_distribution) < error_rate;
                if is_error {
                    match rng.sample(error_type_distribution) {
                        0 => {
                            // substitution
                            let c_index = DNA.iter().position(|&b| b == c).unwrap_or(0);
                            let alt_c = DNA[(c_index + rng.sample(basem1_distribution)) % DNA.len()];
                            seq.push(alt_c);
                            qual.push(ERROR_QV);
                            t_index += 1;
                        },
                        1 => {
                            // deletion
                            t_index += 1;
                        },
                        _ => {
                            // insertion
                            seq.push(DNA[rng.sample(base_distribution)]);
                            qual.push(ERROR_QV);
                        }
                    }
                } else {
                    seq.push(c);
                    qual.push(GOOD_QV);
                    t_index += 1;
                }
            }
            if seq.is_empty() {
                // everything was deleted, keep one base so the read is valid
                seq.push(template[start]);
                qual.push(GOOD_QV);
            }

            let ident = i as u64 + 1;
            if i % 2 == 1 {
                qual.reverse();
                FragmentInput::new(ident, reverse_complement(&seq), qual, end, start)
            } else {
                FragmentInput::new(ident, seq, qual, start, end)
            }
        })
        .collect();

    (template, fragments)
}
