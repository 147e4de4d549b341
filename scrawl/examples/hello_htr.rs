use std::collections::VecDeque;
use std::error::Error;

use rten::Model;
use scrawl::{HtrEngine, HtrEngineParams, Vocabulary};

struct Args {
    image: String,
}

fn parse_args() -> Result<Args, lexopt::Error> {
    use lexopt::prelude::*;

    let mut values = VecDeque::new();
    let mut parser = lexopt::Parser::from_env();

    while let Some(arg) = parser.next()? {
        match arg {
            Value(val) => values.push_back(val.string()?),
            Long("help") => {
                println!(
                    "Usage: {bin_name} <image>",
                    bin_name = parser.bin_name().unwrap_or("hello_htr")
                );
                std::process::exit(0);
            }
            _ => return Err(arg.unexpected()),
        }
    }

    let image = values.pop_front().ok_or("missing `image` arg")?;

    Ok(Args { image })
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args()?;

    // The model and the vocabulary it was trained with are expected in the
    // current directory.
    let model = Model::load_file("handwriting.rten")?;
    let vocabulary = Vocabulary::from_file("vocab.txt")?;

    let engine = HtrEngine::new(HtrEngineParams {
        recognition_model: Some(Box::new(model)),
        vocabulary: Some(vocabulary),
        ..Default::default()
    })?;

    // Decoding, greyscale conversion, resizing and padding all happen inside
    // the engine.
    let recognition = engine.predict_path(&args.image)?;
    println!("{}", recognition.text);

    Ok(())
}
