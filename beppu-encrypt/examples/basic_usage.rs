use beppu_encrypt::{FileCipher, FileKey};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("🔐 Beppu At-Rest Encryption Example");
    println!("===================================");

    // Generate a fresh key, as the upload processor does at finalize time
    let key = FileKey::generate();
    println!("🔑 Generated key: {}", key.to_base64());

    let original_data = b"Hello, World! This is file content that will be sealed at rest.";
    println!("\n📄 Original: {} bytes", original_data.len());

    println!("\n🔒 Sealing...");
    let sealed = FileCipher::seal(original_data, &key)?;
    println!("   Ciphertext: {} bytes", sealed.ciphertext.len());
    println!("   Nonce: {} bytes", sealed.nonce.len());

    // The key and nonce are what the server persists on the file record
    let stored_key = FileKey::from_bytes(key.as_bytes())?;

    println!("\n🔓 Opening with the stored key...");
    let opened = FileCipher::open(&sealed, &stored_key)?;
    println!("   Recovered: {} bytes", opened.len());

    if original_data == &opened[..] {
        println!("\n✅ Success! Sealed and opened content match.");
    } else {
        println!("\n❌ Error! Content mismatch.");
    }

    // A wrong key must never open the content
    println!("\n🚫 Opening with a wrong key...");
    match FileCipher::open(&sealed, &FileKey::generate()) {
        Ok(_) => println!("   Unexpected success!"),
        Err(e) => println!("   Expected failure: {}", e),
    }

    Ok(())
}
